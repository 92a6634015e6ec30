// End-to-end behaviour of the scheduler with real `sh` commands.
// Ticks are driven explicitly through `tick_at` so every test controls the
// clock; only attempt durations, timeouts and retry delays use real time.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use cronkeeper_core::SchedulerConfig;
use cronkeeper_scheduler::{
    ExecutionRecord, MemoryStore, NotifyPolicy, Outcome, Scheduler, SchedulerError, SqliteStore,
    TaskSpec,
};
use rusqlite::Connection;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn config() -> SchedulerConfig {
    SchedulerConfig {
        tick_secs: 60,
        max_output_chars: 10_000,
        shutdown_grace_secs: 5,
        shell: "sh".to_string(),
        history_per_task: 50,
        webhook_timeout_secs: 5,
    }
}

fn scheduler() -> (Arc<Scheduler>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let scheduler = Scheduler::new(&config(), store.clone(), store.clone()).unwrap();
    (Arc::new(scheduler), store)
}

fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 19, h, m, s).unwrap()
}

/// Poll until `name` has at least `count` records (oldest first) or `limit` passes.
async fn wait_for_records(
    scheduler: &Scheduler,
    name: &str,
    count: usize,
    limit: Duration,
) -> Vec<ExecutionRecord> {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let mut records = scheduler.get_history(Some(name));
        if records.len() >= count || tokio::time::Instant::now() >= deadline {
            records.reverse();
            return records;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Poll until `name` is no longer running.
async fn wait_idle(scheduler: &Scheduler, name: &str) {
    for _ in 0..400 {
        match scheduler.task_state(name) {
            Some(state) if state.running => tokio::time::sleep(Duration::from_millis(25)).await,
            _ => return,
        }
    }
    panic!("task {name} still running");
}

#[tokio::test(flavor = "multi_thread")]
async fn every_five_minutes_dispatches_only_on_multiples_of_five() {
    let (scheduler, _) = scheduler();
    scheduler
        .add_task(TaskSpec::new("five", "*/5 * * * *", "true"))
        .unwrap();

    let mut fired = Vec::new();
    for minute in 0..60 {
        if !scheduler.tick_at(at(13, minute, 0)).is_empty() {
            fired.push(minute);
            wait_idle(&scheduler, "five").await;
        }
    }
    assert_eq!(fired, (0..60).step_by(5).collect::<Vec<u32>>());
}

#[tokio::test(flavor = "multi_thread")]
async fn same_minute_is_dispatched_once() {
    let (scheduler, _) = scheduler();
    scheduler
        .add_task(TaskSpec::new("t", "* * * * *", "true"))
        .unwrap();

    assert_eq!(scheduler.tick_at(at(12, 0, 5)), vec!["t"]);
    wait_idle(&scheduler, "t").await;
    assert!(scheduler.tick_at(at(12, 0, 40)).is_empty());
    assert!(scheduler.tick_at(at(12, 0, 59)).is_empty());

    assert_eq!(wait_for_records(&scheduler, "t", 1, Duration::from_secs(5)).await.len(), 1);
    assert_eq!(
        scheduler.task_state("t").unwrap().last_fired_at,
        Some(at(12, 0, 0))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn running_task_is_not_dispatched_again() {
    let (scheduler, _) = scheduler();
    scheduler
        .add_task(TaskSpec::new("slow", "* * * * *", "sleep 1"))
        .unwrap();

    assert_eq!(scheduler.tick_at(at(12, 0, 0)), vec!["slow"]);
    assert!(scheduler.tick_at(at(12, 1, 0)).is_empty(), "overlap suppressed");
    assert!(!scheduler.run_task_now("slow").unwrap(), "manual run suppressed too");

    wait_idle(&scheduler, "slow").await;
    assert_eq!(scheduler.tick_at(at(12, 2, 0)), vec!["slow"]);
    let records = wait_for_records(&scheduler, "slow", 2, Duration::from_secs(5)).await;
    assert_eq!(records.len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn due_tasks_dispatch_in_priority_order() {
    let (scheduler, _) = scheduler();
    for (name, priority) in [("beta", 5), ("alpha", 5), ("urgent", 10), ("idle", 1)] {
        scheduler
            .add_task(TaskSpec::new(name, "0 * * * *", "true").with_priority(priority))
            .unwrap();
    }
    scheduler
        .add_task(TaskSpec::new("off", "0 * * * *", "true").disabled())
        .unwrap();

    assert_eq!(
        scheduler.tick_at(at(12, 0, 0)),
        vec!["urgent", "alpha", "beta", "idle"]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn timeout_produces_a_single_timed_out_record() {
    let (scheduler, _) = scheduler();
    scheduler
        .add_task(
            TaskSpec::new("sleepy", "* * * * *", "sleep 5")
                .with_timeout(Duration::from_secs(2)),
        )
        .unwrap();

    scheduler.tick_at(at(12, 0, 0));
    let records = wait_for_records(&scheduler, "sleepy", 1, Duration::from_secs(10)).await;
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.outcome, Outcome::TimedOut);
    assert_eq!(record.exit_code, cronkeeper_exec::TIMED_OUT_EXIT_CODE);
    assert!(record.duration_ms() < 4_500, "killed near the 2s limit");

    wait_idle(&scheduler, "sleepy").await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(scheduler.get_history(Some("sleepy")).len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_task_is_retried_up_to_max_attempts() {
    let (scheduler, _) = scheduler();
    scheduler
        .add_task(
            TaskSpec::new("flaky", "* * * * *", "echo nope >&2; exit 1")
                .with_retry(3, Duration::from_secs(1)),
        )
        .unwrap();

    scheduler.tick_at(at(12, 0, 0));
    let records = wait_for_records(&scheduler, "flaky", 3, Duration::from_secs(10)).await;
    assert_eq!(records.len(), 3);
    assert_eq!(
        records.iter().map(|r| r.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(records.iter().all(|r| r.outcome == Outcome::Failed));
    assert!(records.iter().all(|r| r.stderr.trim() == "nope"));
    for pair in records.windows(2) {
        let gap = pair[1].started_at - pair[0].finished_at;
        assert!(gap >= chrono::Duration::seconds(1), "gap was {gap}");
    }

    wait_idle(&scheduler, "flaky").await;
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(scheduler.get_history(Some("flaky")).len(), 3, "no 4th attempt");
    assert_eq!(scheduler.task_state("flaky").unwrap().retry, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn paused_instants_are_not_made_up() {
    let (scheduler, _) = scheduler();
    scheduler
        .add_task(TaskSpec::new("t", "*/5 * * * *", "true"))
        .unwrap();

    scheduler.pause();
    assert!(scheduler.get_status().paused);
    assert!(scheduler.tick_at(at(12, 5, 0)).is_empty());
    assert_eq!(scheduler.task_state("t").unwrap().last_fired_at, None);

    scheduler.resume();
    assert!(scheduler.tick_at(at(12, 6, 0)).is_empty(), "12:05 is not made up");
    assert!(scheduler.tick_at(at(12, 9, 0)).is_empty());
    assert_eq!(scheduler.tick_at(at(12, 10, 0)), vec!["t"]);
    wait_idle(&scheduler, "t").await;

    let records = scheduler.get_history(Some("t"));
    assert_eq!(records.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn removing_a_task_cancels_its_pending_retry() {
    let (scheduler, _) = scheduler();
    scheduler
        .add_task(
            TaskSpec::new("doomed", "* * * * *", "exit 3").with_retry(3, Duration::from_secs(1)),
        )
        .unwrap();

    scheduler.tick_at(at(12, 0, 0));
    let records = wait_for_records(&scheduler, "doomed", 1, Duration::from_secs(5)).await;
    assert_eq!(records.len(), 1);
    scheduler.remove_task("doomed").unwrap();

    tokio::time::sleep(Duration::from_millis(2_000)).await;
    assert_eq!(scheduler.get_history(Some("doomed")).len(), 1);
    assert!(matches!(
        scheduler.get_task("doomed"),
        Err(SchedulerError::TaskNotFound { .. })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn status_counts_every_registered_task() {
    let (scheduler, _) = scheduler();
    scheduler
        .add_task(TaskSpec::new("busy", "* * * * *", "sleep 1"))
        .unwrap();
    scheduler
        .add_task(TaskSpec::new("quiet", "@monthly", "true"))
        .unwrap();

    scheduler.tick_at(at(12, 0, 0));
    let status = scheduler.get_status();
    assert_eq!(status.tasks_count, 2);
    assert_eq!(status.in_flight, 1);
    assert!(!status.running, "trigger loop not started");
    assert_eq!(status.tick_secs, 60);

    wait_idle(&scheduler, "busy").await;
    let status = scheduler.get_status();
    assert_eq!(status.tasks_count, 2);
    assert_eq!(status.in_flight, 0);
    assert_eq!(status.run_count, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn environment_and_working_dir_reach_the_command() {
    let (scheduler, _) = scheduler();
    let mut spec = TaskSpec::new("ctx", "@daily", "echo \"$GREETING\"; pwd")
        .with_env("GREETING", "hello from cronkeeper");
    spec.working_dir = Some(std::env::temp_dir());
    scheduler.add_task(spec).unwrap();

    assert!(scheduler.run_task_now("ctx").unwrap());
    let records = wait_for_records(&scheduler, "ctx", 1, Duration::from_secs(5)).await;
    let mut lines = records[0].stdout.lines();
    assert_eq!(lines.next(), Some("hello from cronkeeper"));
    let pwd = std::path::PathBuf::from(lines.next().unwrap());
    assert_eq!(
        pwd.canonicalize().unwrap(),
        std::env::temp_dir().canonicalize().unwrap()
    );
    assert_eq!(scheduler.task_state("ctx").unwrap().last_fired_at, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn unstartable_command_is_recorded_as_failure() {
    let (scheduler, _) = scheduler();
    let mut spec = TaskSpec::new("nowhere", "* * * * *", "true");
    spec.working_dir = Some("/definitely/not/a/dir".into());
    scheduler.add_task(spec).unwrap();

    scheduler.tick_at(at(12, 0, 0));
    let records = wait_for_records(&scheduler, "nowhere", 1, Duration::from_secs(5)).await;
    assert_eq!(records[0].outcome, Outcome::Failed);
    assert_eq!(records[0].exit_code, cronkeeper_exec::SPAWN_FAILED_EXIT_CODE);
    assert!(!records[0].stderr.is_empty());

    wait_idle(&scheduler, "nowhere").await;
    assert_eq!(scheduler.tick_at(at(12, 1, 0)), vec!["nowhere"], "scheduler keeps going");
}

#[tokio::test]
async fn unavailable_store_rejects_mutations_without_side_effects() {
    let (scheduler, store) = scheduler();
    scheduler
        .add_task(TaskSpec::new("kept", "@hourly", "true"))
        .unwrap();
    store.set_fail_writes(true);

    let err = scheduler
        .add_task(TaskSpec::new("lost", "@hourly", "true"))
        .unwrap_err();
    assert_eq!(err.code(), "PERSISTENCE_ERROR");
    assert!(scheduler.remove_task("kept").is_err());
    assert!(scheduler.set_enabled("kept", false).is_err());

    let names: Vec<_> = scheduler.list_tasks().into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["kept"]);
    assert!(scheduler.get_task("kept").unwrap().enabled);
}

#[tokio::test]
async fn validation_errors_create_nothing() {
    let (scheduler, store) = scheduler();
    scheduler
        .add_task(TaskSpec::new("dup", "@hourly", "true"))
        .unwrap();

    let err = scheduler
        .add_task(TaskSpec::new("dup", "@daily", "false"))
        .unwrap_err();
    assert_eq!(err.code(), "DUPLICATE_TASK");

    let err = scheduler
        .add_task(TaskSpec::new("bad", "0 25 * * *", "true"))
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_TRIGGER");
    assert!(err.to_string().contains("hour"));

    assert_eq!(scheduler.list_tasks().len(), 1);
    assert_eq!(cronkeeper_scheduler::DefinitionStore::load_all(&*store).unwrap().len(), 1);
    assert!(matches!(
        scheduler.remove_task("bad"),
        Err(SchedulerError::TaskNotFound { .. })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn disabled_tasks_are_skipped_until_reenabled() {
    let (scheduler, _) = scheduler();
    scheduler
        .add_task(TaskSpec::new("t", "* * * * *", "true"))
        .unwrap();

    scheduler.set_enabled("t", false).unwrap();
    assert!(scheduler.tick_at(at(12, 0, 0)).is_empty());

    scheduler.set_enabled("t", true).unwrap();
    assert_eq!(scheduler.tick_at(at(12, 1, 0)), vec!["t"]);
    wait_idle(&scheduler, "t").await;
}

#[tokio::test(flavor = "multi_thread")]
async fn run_loop_fires_reboot_tasks_and_stops_on_shutdown() {
    let (scheduler, _) = scheduler();
    scheduler
        .add_task(TaskSpec::new("boot", "@reboot", "echo booted"))
        .unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(scheduler.clone().run(shutdown_rx));

    let records = wait_for_records(&scheduler, "boot", 1, Duration::from_secs(5)).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].stdout.trim(), "booted");
    let status = scheduler.get_status();
    assert!(status.running);
    assert!(status.started_at.is_some());

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(!scheduler.get_status().running);
    assert_eq!(scheduler.get_history(Some("boot")).len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn sqlite_state_survives_a_restart() {
    let store = Arc::new(SqliteStore::new(Connection::open_in_memory().unwrap()).unwrap());
    {
        let scheduler = Scheduler::new(&config(), store.clone(), store.clone()).unwrap();
        scheduler
            .add_task(
                TaskSpec::new("nightly", "0 3 * * *", "exit 1")
                    .with_retry(2, Duration::from_secs(3600)),
            )
            .unwrap();
        scheduler.tick_at(Utc.with_ymd_and_hms(2026, 10, 19, 3, 0, 0).unwrap());
        let records = wait_for_records(&scheduler, "nightly", 1, Duration::from_secs(5)).await;
        assert_eq!(records.len(), 1);
        // Let the outcome land in the registry before "restarting".
        for _ in 0..100 {
            if scheduler.task_state("nightly").unwrap().retry.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    let restarted = Scheduler::new(&config(), store.clone(), store.clone()).unwrap();
    let task = restarted.get_task("nightly").unwrap();
    assert_eq!(task.retry.max_attempts, 2);

    let state = restarted.task_state("nightly").unwrap();
    let retry = state.retry.expect("pending retry restored");
    assert_eq!(retry.attempt, 2);
    assert!(state.running, "a pending retry chain counts as running");
    assert_eq!(
        state.last_fired_at,
        Some(Utc.with_ymd_and_hms(2026, 10, 19, 3, 0, 0).unwrap())
    );

    let history = restarted.get_history(Some("nightly"));
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].outcome, Outcome::Failed);
}

#[tokio::test(flavor = "multi_thread")]
async fn restarted_scheduler_resumes_an_overdue_retry() {
    let store = Arc::new(SqliteStore::new(Connection::open_in_memory().unwrap()).unwrap());
    let marker = std::env::temp_dir().join(format!("cronkeeper-retry-{}", uuid::Uuid::new_v4()));
    // Fails the first time, succeeds once the marker exists.
    let command = format!(
        "test -f '{0}' || {{ touch '{0}'; exit 1; }}",
        marker.display()
    );
    // Feb 29th keeps the real clock from ever firing it during the test.
    let leap_day = Utc.with_ymd_and_hms(2028, 2, 29, 3, 0, 0).unwrap();

    let first = Arc::new(Scheduler::new(&config(), store.clone(), store.clone()).unwrap());
    first
        .add_task(
            TaskSpec::new("leap", "0 3 29 2 *", command).with_retry(2, Duration::from_secs(2)),
        )
        .unwrap();
    let (stop_first, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(first.clone().run(rx));

    assert_eq!(first.tick_at(leap_day), vec!["leap"]);
    wait_for_records(&first, "leap", 1, Duration::from_secs(5)).await;
    for _ in 0..100 {
        if first.task_state("leap").unwrap().retry.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    stop_first.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.get_history(Some("leap")).len(), 1, "retry timer was cancelled");
    drop(first);

    // Let the persisted retry become overdue while nothing is running.
    tokio::time::sleep(Duration::from_millis(2_200)).await;

    let second = Arc::new(Scheduler::new(&config(), store.clone(), store.clone()).unwrap());
    let pending = second.task_state("leap").unwrap();
    assert!(pending.running);
    assert!(pending.retry.unwrap().next_attempt_at < Utc::now());

    let (stop_second, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(second.clone().run(rx));

    let records = wait_for_records(&second, "leap", 2, Duration::from_secs(2)).await;
    assert_eq!(
        records.iter().map(|r| (r.attempt, r.outcome)).collect::<Vec<_>>(),
        vec![(1, Outcome::Failed), (2, Outcome::Succeeded)]
    );
    assert!(records[1].started_at - records[0].finished_at >= chrono::Duration::seconds(2));

    wait_idle(&second, "leap").await;
    let summary = second.task_summary("leap").unwrap();
    assert!(!summary.state.running);
    assert_eq!(summary.state.retry, None);
    assert_eq!(summary.state.stats.run_count, 2);
    assert_eq!(summary.state.stats.fail_count, 1);
    assert_eq!(summary.state.stats.last_outcome, Some(Outcome::Succeeded));
    assert_eq!(summary.next_run, Some(leap_day));

    let next_leap_day = Utc.with_ymd_and_hms(2032, 2, 29, 3, 0, 0).unwrap();
    assert_eq!(second.tick_at(next_leap_day), vec!["leap"], "chain over, task fires again");
    wait_idle(&second, "leap").await;

    stop_second.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    std::fs::remove_file(&marker).ok();
}

/// Accept one HTTP request, answer `200 OK`, and return its lowercased head
/// and its body.
async fn serve_one_request(listener: tokio::net::TcpListener) -> (String, String) {
    let (mut socket, _) = listener.accept().await.unwrap();
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before the request was complete");
        buf.extend_from_slice(&chunk[..n]);

        let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
        let length = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if buf.len() >= end + 4 + length {
            let body = String::from_utf8_lossy(&buf[end + 4..end + 4 + length]).into_owned();
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await
                .unwrap();
            return (head, body);
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn completion_webhook_is_posted_with_the_final_record() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/hooks/ping", listener.local_addr().unwrap());
    let server = tokio::spawn(serve_one_request(listener));

    let (scheduler, _) = scheduler();
    scheduler
        .add_task(
            TaskSpec::new("ping", "@hourly", "echo pong").with_notify(NotifyPolicy {
                token: Some("s3cret".into()),
                on_success: true,
                ..NotifyPolicy::new(url)
            }),
        )
        .unwrap();
    assert!(scheduler.run_task_now("ping").unwrap());

    let (head, body) = tokio::time::timeout(Duration::from_secs(10), server)
        .await
        .unwrap()
        .unwrap();
    assert!(head.starts_with("post /hooks/ping "), "{head}");
    assert!(head.contains("authorization: bearer s3cret"), "{head}");
    assert!(head.contains("content-type: application/json"), "{head}");

    let event: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(event["task"], "ping");
    assert_eq!(event["outcome"], "succeeded");
    assert_eq!(event["exit_code"], 0);
    assert_eq!(event["attempt"], 1);
    assert_eq!(event["stdout"].as_str().unwrap().trim(), "pong");
}
