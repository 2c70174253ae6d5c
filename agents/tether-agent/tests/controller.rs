//! End-to-end behaviour of the agent controller against the in-memory host.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use tether_agent::agent::controller::{AgentController, EXIT_CLOSED};
use tether_agent::agent::error::{AgentError, LifecycleOp};
use tether_agent::agent::reconcile::DesiredState;
use tether_agent::agent::redirect::RedirectTarget;
use tether_agent::agent::registry::AgentRegistry;
use tether_agent::cache::{content_hash, ContentCache, MemorySource};
use tether_agent::connection::link::{ControlLink, LinkHandle};
use tether_agent::connection::protocol::{AgentMessage, EventKind, InstallUnit, UpdateUnit};
use tether_agent::runtime::adapter::{RuntimeHost, UnitId, UnitState};
use tether_agent::runtime::memory::{HostCall, InMemoryHost, RefreshMode};

struct Harness {
    host: Arc<InMemoryHost>,
    source: Arc<MemorySource>,
    controller: Arc<AgentController>,
    link: LinkHandle,
    outbox: mpsc::Receiver<AgentMessage>,
    registry: AgentRegistry,
    _cache_dir: TempDir,
}

impl Harness {
    fn new(mode: RefreshMode, refresh_timeout: Duration) -> Self {
        let cache_dir = tempfile::tempdir().unwrap();
        let host = Arc::new(InMemoryHost::with_refresh(mode));
        let source = Arc::new(MemorySource::new());
        let cache = ContentCache::new(cache_dir.path()).with_source(source.clone());
        let (link, outbox) = LinkHandle::channel(64);
        let registry = AgentRegistry::new();

        let controller = AgentController::new(
            "edge",
            host.clone(),
            Arc::new(cache),
            Arc::new(link.clone()),
        )
        .with_refresh_timeout(refresh_timeout)
        .with_registry(registry.clone())
        .start();

        Self {
            host,
            source,
            controller,
            link,
            outbox,
            registry,
            _cache_dir: cache_dir,
        }
    }

    fn basic() -> Self {
        Self::new(RefreshMode::Unsupported, Duration::from_secs(5))
    }

    fn drain(&mut self) -> Vec<AgentMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.outbox.try_recv() {
            messages.push(message);
        }
        messages
    }
}

fn desired<S: AsRef<str>>(entries: &[(&str, S)]) -> DesiredState {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.as_ref().to_string()))
        .collect()
}

fn stop(location: &str) -> HostCall {
    HostCall::Stop(location.to_string())
}

fn start(location: &str) -> HostCall {
    HostCall::Start(location.to_string())
}

/// Serve `body` over plain HTTP to every connection, returning the base URL
async fn serve(body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut request = [0u8; 4096];
            let _ = stream.read(&mut request).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_reconcile_deletes_and_installs() {
    let h = Harness::basic();
    let h1 = h.source.insert("unit a v1");
    let h2 = h.source.insert("unit b v1");
    let h3 = h.source.insert("unit c v1");

    let report = h
        .controller
        .reconcile(Some(desired(&[("b", &h2), ("c", &h3)])))
        .await
        .unwrap();
    assert!(report.is_empty());
    h.host.clear_calls();

    let report = h
        .controller
        .reconcile(Some(desired(&[("a", &h1), ("b", &h2)])))
        .await
        .unwrap();

    assert!(report.is_empty(), "unexpected failures: {}", report);
    assert_eq!(
        h.host.calls(),
        vec![
            stop("c"),
            HostCall::Uninstall("c".to_string()),
            HostCall::Install("a".to_string()),
            start("a"),
        ]
    );
    let tracked = h.controller.tracked().await;
    assert_eq!(tracked.keys().cloned().collect::<Vec<_>>(), vec!["b", "a"]);
    assert_eq!(tracked.get("a"), Some(&h1));
}

#[tokio::test]
async fn test_reconcile_updates_changed_unit() {
    let h = Harness::basic();
    let v1 = h.source.insert("unit a v1");
    let v2 = h.source.insert("unit a v2");

    h.controller
        .reconcile(Some(desired(&[("a", &v1)])))
        .await
        .unwrap();
    h.host.clear_calls();

    let report = h
        .controller
        .reconcile(Some(desired(&[("a", &v2)])))
        .await
        .unwrap();

    assert!(report.is_empty());
    assert_eq!(
        h.host.calls(),
        vec![stop("a"), HostCall::Update("a".to_string()), start("a")]
    );
    assert_eq!(h.host.content_of("a").unwrap().as_ref(), b"unit a v2");
    assert_eq!(h.controller.tracked().await.get("a"), Some(&v2));
}

#[tokio::test]
async fn test_unit_discarded_by_stop_is_reinstalled_and_restarted() {
    let h = Harness::basic();
    let v1 = h.source.insert("unit a v1");
    let v2 = h.source.insert("unit a v2");

    h.controller
        .reconcile(Some(desired(&[("a", &v1)])))
        .await
        .unwrap();
    let before = h.host.get("a").await.unwrap().unwrap();
    h.host.discard_on_stop("a");
    h.host.clear_calls();

    let report = h
        .controller
        .reconcile(Some(desired(&[("a", &v2)])))
        .await
        .unwrap();

    assert!(report.is_empty(), "unexpected failures: {}", report);
    assert_eq!(
        h.host.calls(),
        vec![stop("a"), HostCall::Install("a".to_string()), start("a")]
    );
    let after = h.host.get("a").await.unwrap().unwrap();
    assert_ne!(after.id, before.id);
    assert_eq!(after.state, UnitState::Active);
    assert_eq!(h.host.content_of("a").unwrap().as_ref(), b"unit a v2");
    assert_eq!(h.controller.tracked().await.get("a"), Some(&v2));
}

#[tokio::test]
async fn test_inactive_unit_stays_stopped_after_update() {
    let h = Harness::basic();
    let v1 = h.source.insert("unit a v1");
    let v2 = h.source.insert("unit a v2");

    h.controller
        .reconcile(Some(desired(&[("a", &v1)])))
        .await
        .unwrap();
    h.host.set_state("a", UnitState::Resolved);
    h.host.clear_calls();

    h.controller
        .reconcile(Some(desired(&[("a", &v2)])))
        .await
        .unwrap();

    assert_eq!(
        h.host.calls(),
        vec![stop("a"), HostCall::Update("a".to_string())]
    );
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let h = Harness::basic();
    let v1 = h.source.insert("unit a v1");
    let target = desired(&[("a", &v1)]);

    h.controller.reconcile(Some(target.clone())).await.unwrap();
    h.host.clear_calls();

    let report = h.controller.reconcile(Some(target)).await.unwrap();
    assert!(report.is_empty());
    assert!(h.host.calls().is_empty());
}

#[tokio::test]
async fn test_failed_stop_does_not_block_other_units() {
    let h = Harness::basic();
    let a = h.source.insert("unit a v1");
    let b = h.source.insert("unit b v1");

    h.controller
        .reconcile(Some(desired(&[("a", &a), ("b", &b)])))
        .await
        .unwrap();
    h.host.fail_on(LifecycleOp::Stop, "a");
    h.host.clear_calls();

    let report = h.controller.reconcile(Some(DesiredState::new())).await.unwrap();

    assert_eq!(report.len(), 1);
    assert!(report.lines()[0].starts_with("Trying to stop a"));
    assert!(h.host.calls().contains(&HostCall::Uninstall("b".to_string())));
    assert!(h.host.get("b").await.unwrap().is_none());
    assert!(!h.controller.tracked().await.contains_key("b"));
}

#[tokio::test]
async fn test_reconcile_failures_name_units_by_location() {
    let h = Harness::basic();
    let a1 = h.source.insert("unit a v1");
    let a2 = h.source.insert("unit a v2");
    let b = h.source.insert("unit b v1");

    h.controller
        .reconcile(Some(desired(&[("a", &a1)])))
        .await
        .unwrap();
    h.host.fail_on(LifecycleOp::Stop, "a");
    h.host.fail_on(LifecycleOp::Install, "b");

    let report = h
        .controller
        .reconcile(Some(desired(&[("a", &a2), ("b", &b)])))
        .await
        .unwrap();

    assert_eq!(
        report.lines(),
        &[
            "Trying to stop a: stop rejected for a".to_string(),
            "Trying to install b: install rejected for b".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_missing_content_is_reported_per_unit() {
    let h = Harness::basic();
    let a = h.source.insert("unit a v1");
    let missing = content_hash(b"never published");

    let report = h
        .controller
        .reconcile(Some(desired(&[("ghost", &missing), ("a", &a)])))
        .await
        .unwrap();

    assert_eq!(report.len(), 1);
    assert_eq!(
        report.lines()[0],
        format!("Could not find content with hash {} for ghost", missing)
    );
    let tracked = h.controller.tracked().await;
    assert!(tracked.contains_key("a"));
    assert!(!tracked.contains_key("ghost"));
}

#[tokio::test]
async fn test_refresh_follows_only_clean_runs() {
    let h = Harness::new(RefreshMode::Immediate, Duration::from_secs(5));
    let a = h.source.insert("unit a v1");
    let b = h.source.insert("unit b v1");

    h.controller
        .reconcile(Some(desired(&[("a", &a)])))
        .await
        .unwrap();
    assert_eq!(h.host.refresh_count(), 1);

    h.host.fail_on(LifecycleOp::Install, "b");
    let report = h
        .controller
        .reconcile(Some(desired(&[("a", &a), ("b", &b)])))
        .await
        .unwrap();
    assert_eq!(report.len(), 1);
    assert_eq!(h.host.refresh_count(), 1);
}

#[tokio::test]
async fn test_reconcile_waits_for_outstanding_refresh() {
    let h = Harness::new(RefreshMode::Manual, Duration::from_secs(5));
    let a = h.source.insert("unit a v1");
    let b = h.source.insert("unit b v1");

    h.controller
        .reconcile(Some(desired(&[("a", &a)])))
        .await
        .unwrap();
    assert_eq!(h.host.refresh_count(), 1);
    h.host.clear_calls();

    let controller = h.controller.clone();
    let second = {
        let target = desired(&[("a", &a), ("b", &b)]);
        tokio::spawn(async move { controller.reconcile(Some(target)).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!second.is_finished());
    assert!(h.host.calls().is_empty());

    assert_eq!(h.host.complete_refreshes(), 1);
    let report = second.await.unwrap().unwrap();
    assert!(report.is_empty());
    assert!(h
        .host
        .calls()
        .contains(&HostCall::Install("b".to_string())));
}

#[tokio::test]
async fn test_reconcile_fails_when_refresh_never_completes() {
    let h = Harness::new(RefreshMode::Manual, Duration::from_millis(50));
    let a = h.source.insert("unit a v1");

    h.controller
        .reconcile(Some(desired(&[("a", &a)])))
        .await
        .unwrap();

    let result = h.controller.reconcile(Some(DesiredState::new())).await;
    assert!(matches!(result, Err(AgentError::RefreshTimeout(_))));
    assert!(h.controller.tracked().await.contains_key("a"));
}

#[tokio::test]
async fn test_batch_operations_continue_past_failures() {
    let h = Harness::basic();
    let a = h.source.insert("unit a v1");
    let missing = content_hash(b"never published");

    let report = h
        .controller
        .install(vec![
            InstallUnit {
                location: "ghost".to_string(),
                hash: missing,
            },
            InstallUnit {
                location: "a".to_string(),
                hash: a,
            },
        ])
        .await;
    assert_eq!(report.len(), 1);
    let unit = h.host.get("a").await.unwrap().unwrap();

    let report = h.controller.start_units(&[UnitId(99), unit.id]).await;
    assert_eq!(report.lines(), &["No unit with id 99".to_string()]);
    assert_eq!(
        h.host.get("a").await.unwrap().map(|u| u.state),
        Some(UnitState::Active)
    );

    let a2 = h.source.insert("unit a v2");
    let report = h
        .controller
        .update(vec![UpdateUnit { id: unit.id, hash: a2.clone() }])
        .await;
    assert!(report.is_empty());
    assert_eq!(h.controller.tracked().await.get("a"), Some(&a2));

    let report = h.controller.uninstall(&[unit.id]).await;
    assert!(report.is_empty());
    assert!(h.controller.tracked().await.is_empty());
    assert!(h.controller.list_units(&[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_console_redirect_mirrors_failures() {
    let mut h = Harness::basic();

    assert!(h.controller.redirect(RedirectTarget::Console).await.unwrap());
    assert!(!h.controller.redirect(RedirectTarget::Console).await.unwrap());

    let missing = content_hash(b"never published");
    h.controller
        .install(vec![InstallUnit {
            location: "ghost".to_string(),
            hash: missing,
        }])
        .await;

    let output: Vec<String> = h
        .drain()
        .into_iter()
        .filter_map(|m| match m {
            AgentMessage::Output(payload) => Some(payload.text),
            _ => None,
        })
        .collect();
    assert_eq!(output.len(), 1);
    assert!(output[0].contains("Could not find content"));
}

#[tokio::test]
async fn test_teardown_runs_once() {
    let mut h = Harness::basic();
    let a = h.source.insert("unit a v1");
    h.controller
        .reconcile(Some(desired(&[("a", &a)])))
        .await
        .unwrap();
    assert!(h.registry.get("edge").is_some());

    h.controller.close().await.unwrap();
    h.controller.abort(-3).await.unwrap();

    assert!(h.controller.is_closed());
    assert!(!h.controller.ping());
    assert!(h.link.is_closed());
    assert!(h.registry.is_empty());
    assert!(h.host.list().await.unwrap().is_empty());

    let exits: Vec<i32> = h
        .drain()
        .into_iter()
        .filter_map(|m| match m {
            AgentMessage::Event(payload) if payload.event.kind == EventKind::Exit => {
                Some(payload.event.code)
            }
            _ => None,
        })
        .collect();
    assert_eq!(exits, vec![EXIT_CLOSED]);
}

#[tokio::test]
async fn test_concurrent_teardown_runs_once() {
    let mut h = Harness::basic();
    let a = h.source.insert("unit a v1");
    h.controller
        .reconcile(Some(desired(&[("a", &a)])))
        .await
        .unwrap();
    h.host.clear_calls();

    let (closed, aborted) = tokio::join!(h.controller.close(), h.controller.abort(-3));
    assert!(closed.is_ok());
    assert!(aborted.is_ok());

    let uninstalls = h
        .host
        .calls()
        .into_iter()
        .filter(|c| *c == HostCall::Uninstall("a".to_string()))
        .count();
    assert_eq!(uninstalls, 1);

    let exits = h
        .drain()
        .into_iter()
        .filter(|m| {
            matches!(m, AgentMessage::Event(payload) if payload.event.kind == EventKind::Exit)
        })
        .count();
    assert_eq!(exits, 1);
}

#[tokio::test]
async fn test_install_and_update_from_url() {
    let h = Harness::new(RefreshMode::Immediate, Duration::from_secs(5));
    let v1 = format!("{}/a-v1.json", serve("unit a v1").await);
    let v2 = format!("{}/a-v2.json", serve("unit a v2").await);

    let report = h.controller.install_from_url("a", &v1).await;
    assert!(report.is_empty(), "unexpected failures: {}", report);
    assert_eq!(h.controller.tracked().await.get("a"), Some(&v1));
    assert_eq!(h.host.content_of("a").unwrap().as_ref(), b"unit a v1");

    let unit = h.host.get("a").await.unwrap().unwrap();
    let refreshes = h.host.refresh_count();
    let report = h.controller.update_from_url(unit.id, &v2).await;
    assert!(report.is_empty(), "unexpected failures: {}", report);
    assert_eq!(h.controller.tracked().await.get("a"), Some(&v2));
    assert_eq!(h.host.content_of("a").unwrap().as_ref(), b"unit a v2");
    assert_eq!(h.host.refresh_count(), refreshes + 1);
}

#[tokio::test]
async fn test_update_from_url_reports_unknown_unit() {
    let h = Harness::new(RefreshMode::Immediate, Duration::from_secs(5));

    let report = h
        .controller
        .update_from_url(UnitId(99), "http://127.0.0.1:9/unused.json")
        .await;
    assert_eq!(report.lines(), &["No unit with id 99".to_string()]);
    assert_eq!(h.host.refresh_count(), 0);
}

#[tokio::test]
async fn test_host_events_are_forwarded() {
    let mut h = Harness::basic();
    let handle = h.controller.forward_host_events().unwrap();

    h.host.emit(7);
    let message = tokio::time::timeout(Duration::from_secs(1), h.outbox.recv())
        .await
        .unwrap()
        .unwrap();
    match message {
        AgentMessage::Event(payload) => {
            assert_eq!(payload.event.kind, EventKind::HostEvent);
            assert_eq!(payload.event.code, 7);
        }
        other => panic!("Expected host event, got {:?}", other),
    }

    h.controller.close().await.unwrap();
    h.host.emit(8);
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
}
