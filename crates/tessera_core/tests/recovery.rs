//! Reopen and crash recovery.

use tessera_core::{CoreError, Engine, Task};
use tessera_storage::BufferMode;
use tessera_testkit::{scenarios, CrashFixture, TestEngine};

fn read_at(engine: &Engine, commit_time: tessera_core::Timestamp, key: Vec<u8>) -> Option<Vec<u8>> {
    engine
        .submit(Task::historical(commit_time, ["a"], move |ctx| ctx.get("a", &key)))
        .unwrap()
        .get()
        .unwrap()
}

fn reopen_preserves_history(mode: BufferMode) {
    let engine = TestEngine::file(mode);
    let times = scenarios::populate(&engine, "a", 3);
    let counter = engine.commit_counter();

    let engine = engine.reopen();

    assert_eq!(engine.commit_counter(), counter);
    assert_eq!(engine.last_commit_time(), times[2]);
    assert_eq!(read_at(&engine, times[0], scenarios::key(0)), Some(scenarios::value(0)));
    assert_eq!(read_at(&engine, times[0], scenarios::key(1)), None);
    assert_eq!(read_at(&engine, times[2], scenarios::key(2)), Some(scenarios::value(2)));

    let later = scenarios::populate(&engine, "a", 1);
    assert!(later[0] > times[2]);
}

#[test]
fn disk_worm_reopen_preserves_history() {
    reopen_preserves_history(BufferMode::DiskWorm);
}

#[test]
fn disk_rw_reopen_preserves_history() {
    reopen_preserves_history(BufferMode::DiskRw);
}

#[test]
fn direct_reopen_preserves_history() {
    reopen_preserves_history(BufferMode::Direct);
}

#[test]
fn torn_root_block_recovers_prior_commit() {
    let fixture = CrashFixture::new();
    let engine = fixture.open().unwrap();
    let times = scenarios::populate(&engine, "a", 2);
    let counter = engine.commit_counter();
    let next_slot = engine.root_block().slot.other();

    fixture.control().tear_write_at(next_slot.offset(), 12);
    let tx = engine.begin_tx().unwrap();
    tx.get_index("a").unwrap().unwrap().put("lost", "x").unwrap();
    let outcome = engine.commit_tx(&tx);
    assert!(matches!(outcome, Err(CoreError::CommitFailed { .. })));
    assert!(fixture.control().has_crashed());
    drop(engine);

    let engine = fixture.recover().unwrap();
    assert_eq!(engine.commit_counter(), counter);
    assert_eq!(engine.last_commit_time(), times[1]);
    assert_eq!(read_at(&engine, times[1], scenarios::key(1)), Some(scenarios::value(1)));
    assert_eq!(read_at(&engine, times[1], b"lost".to_vec()), None);

    scenarios::populate(&engine, "a", 1);
    assert_eq!(engine.commit_counter(), counter + 1);
}

#[test]
fn failed_sync_before_root_block_keeps_prior_commit() {
    let fixture = CrashFixture::new();
    let engine = fixture.open().unwrap();
    scenarios::populate(&engine, "a", 1);
    let counter = engine.commit_counter();

    fixture.control().fail_on_sync();
    let outcome = engine.transaction(|tx| tx.get_index("a")?.unwrap().put("lost", "x"));
    assert!(outcome.is_err());
    assert_eq!(engine.commit_counter(), counter);
    drop(engine);

    let engine = fixture.recover().unwrap();
    assert_eq!(engine.commit_counter(), counter);
    let value = engine
        .submit(Task::unisolated(["a"], |ctx| ctx.get("a", b"lost")))
        .unwrap()
        .get()
        .unwrap();
    assert_eq!(value, None);
}

#[test]
fn failed_commit_leaves_engine_usable_after_reset() {
    let fixture = CrashFixture::new();
    let engine = fixture.open().unwrap();
    scenarios::populate(&engine, "a", 1);
    let counter = engine.commit_counter();

    fixture.control().fail_on_sync();
    assert!(scenarios_write(&engine, "first").is_err());
    assert_eq!(engine.stats().commit_failures(), 1);

    fixture.control().reset();
    scenarios_write(&engine, "second").unwrap();
    assert_eq!(engine.commit_counter(), counter + 1);
    let first = engine
        .submit(Task::unisolated(["a"], |ctx| ctx.get("a", b"first")))
        .unwrap()
        .get()
        .unwrap();
    assert_eq!(first, None);
}

fn scenarios_write(engine: &Engine, key: &'static str) -> tessera_core::CoreResult<()> {
    engine
        .submit(Task::unisolated(["a"], move |ctx| ctx.put("a", key, "v")))?
        .get()
}
