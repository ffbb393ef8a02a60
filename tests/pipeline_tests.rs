mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{fast_policy, wait_until, FakeFetcher, FakeRenderer, FakeSessions, Journal};
use rfgrid::collector::DomSnapshot;
use rfgrid::pipeline::{CheckListener, Coordinator, MatchResult, Services, SessionStartInfo};
use rfgrid::render::{BrowserType, CheckSettings, PlatformType, RenderTarget};
use rfgrid::{Error, GridConfig, Viewport};

fn start(sessions: &Arc<FakeSessions>, renderer: &Arc<FakeRenderer>, test_concurrency: usize) -> Coordinator {
    let config = GridConfig {
        tick_ms: 1,
        test_concurrency,
        retry: fast_policy(),
        ..Default::default()
    };
    let services = Services::new(Arc::new(FakeFetcher::new()), renderer.clone(), sessions.clone());
    Coordinator::start(config, services).unwrap()
}

fn start_info(name: &str) -> SessionStartInfo {
    SessionStartInfo {
        app_name: "app".into(),
        test_name: name.into(),
        batch_id: None,
        target: RenderTarget::new(BrowserType::Chrome, Viewport::default()),
    }
}

fn page(url: &str) -> DomSnapshot {
    DomSnapshot {
        url: url.into(),
        nodes: vec![serde_json::json!({"nodeType": 9})],
        ..Default::default()
    }
}

/// Check settings whose name doubles as the match latency in milliseconds.
fn named(name: &str) -> CheckSettings {
    CheckSettings {
        name: Some(name.into()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_closes_only_after_all_checks_are_terminal() {
    let sessions = Arc::new(FakeSessions::new());
    let renderer = Arc::new(FakeRenderer::new());
    let coordinator = start(&sessions, &renderer, 5);
    let journal = Journal::new();

    let test = coordinator.open_test(start_info("ordering"), journal.clone()).unwrap();
    let mut steps = Vec::new();
    for delay in ["40", "5", "20"] {
        let url = format!("https://a.test/{}", delay);
        steps.extend(coordinator.check(page(&url), named(delay), &[&test], journal.clone()).unwrap());
    }
    test.close().unwrap();

    assert!(wait_until(|| journal.count("closed:") == 1).await);
    let events = journal.events();
    let closed_at = events.iter().position(|e| e.starts_with("closed:")).unwrap();
    for step in &steps {
        let ok_at = events.iter().position(|e| *e == format!("check-ok:{}", step)).unwrap();
        assert!(ok_at < closed_at, "{:?}", events);
    }
    assert_eq!(*sessions.closes.lock().unwrap(), vec![(test.id().to_string(), false)]);
    assert!(coordinator.error().is_none());
}

#[tokio::test]
async fn aborted_test_drops_late_results_silently() {
    let sessions = Arc::new(FakeSessions::new());
    let renderer = Arc::new(FakeRenderer::new());
    let coordinator = start(&sessions, &renderer, 5);
    let journal = Journal::new();

    let test = coordinator.open_test(start_info("aborted"), journal.clone()).unwrap();
    coordinator
        .check(page("https://a.test/slow"), named("200"), &[&test], journal.clone())
        .unwrap();
    assert!(wait_until(|| sessions.matches_started.load(Ordering::SeqCst) == 1).await);

    test.abort().unwrap();
    assert!(!test.is_active());
    assert!(wait_until(|| journal.count("closed:") == 1).await);
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(journal.count("check-"), 0, "{:?}", journal.events());
    assert_eq!(*sessions.closes.lock().unwrap(), vec![(test.id().to_string(), true)]);
}

#[tokio::test]
async fn never_opened_test_fails_its_checks_and_its_close() {
    let sessions = Arc::new(FakeSessions::new());
    sessions.fail_open.lock().unwrap().insert("broken".to_string());
    let renderer = Arc::new(FakeRenderer::new());
    let coordinator = start(&sessions, &renderer, 1);
    let journal = Journal::new();

    let broken = coordinator.open_test(start_info("broken"), journal.clone()).unwrap();
    coordinator
        .check(page("https://a.test/"), named("0"), &[&broken], journal.clone())
        .unwrap();
    broken.close().unwrap();

    assert!(wait_until(|| journal.count("close-fail:") == 1).await);
    assert_eq!(journal.count("open-fail:"), 1);
    assert_eq!(journal.count("check-fail:"), 1);
    assert!(sessions.closes.lock().unwrap().is_empty());

    // the open slot came back, so another test can open
    let next = coordinator.open_test(start_info("next"), journal.clone()).unwrap();
    assert!(wait_until(|| journal.count("open:") == 1).await);
    next.close().unwrap();
    assert!(wait_until(|| journal.count("closed:") == 1).await);
}

#[tokio::test]
async fn open_slot_is_released_when_a_test_closes() {
    let sessions = Arc::new(FakeSessions::new());
    let renderer = Arc::new(FakeRenderer::new());
    let coordinator = start(&sessions, &renderer, 1);
    let journal = Journal::new();

    let first = coordinator.open_test(start_info("first"), journal.clone()).unwrap();
    let second = coordinator.open_test(start_info("second"), journal.clone()).unwrap();
    assert!(wait_until(|| sessions.opened.lock().unwrap().len() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*sessions.opened.lock().unwrap(), vec!["first".to_string()]);

    first.close().unwrap();
    assert!(wait_until(|| sessions.opened.lock().unwrap().len() == 2).await);
    let events = journal.events();
    let closed_first = events.iter().position(|e| *e == format!("closed:{}", first.id())).unwrap();
    let opened_second = events.iter().position(|e| *e == format!("open:{}", second.id())).unwrap();
    assert!(closed_first < opened_second);
}

#[tokio::test]
async fn one_snapshot_for_many_tests_is_one_batch() {
    let sessions = Arc::new(FakeSessions::new());
    let renderer = Arc::new(FakeRenderer::new());
    let coordinator = start(&sessions, &renderer, 5);
    let journal = Journal::new();

    let a = coordinator.open_test(start_info("a"), journal.clone()).unwrap();
    let b = coordinator.open_test(start_info("b"), journal.clone()).unwrap();
    assert!(wait_until(|| journal.count("open:") == 2).await);

    let steps = coordinator
        .check(page("https://a.test/shared"), CheckSettings::default(), &[&a, &b], journal.clone())
        .unwrap();
    assert_eq!(steps.len(), 2);
    assert!(wait_until(|| journal.count("check-ok:") == 2).await);

    // the document was uploaded ahead of rendering, so one submission sufficed
    assert_eq!(*renderer.batches.lock().unwrap(), vec![2]);
}

#[tokio::test]
async fn render_failure_reaches_only_its_own_check() {
    let sessions = Arc::new(FakeSessions::new());
    let renderer = Arc::new(FakeRenderer::new());
    renderer.broken_pages.lock().unwrap().insert("https://a.test/crash".to_string());
    let coordinator = start(&sessions, &renderer, 5);
    let journal = Journal::new();

    let test = coordinator.open_test(start_info("mixed"), journal.clone()).unwrap();
    let good = coordinator
        .check(page("https://a.test/fine"), CheckSettings::default(), &[&test], journal.clone())
        .unwrap();
    let bad = coordinator
        .check(page("https://a.test/crash"), CheckSettings::default(), &[&test], journal.clone())
        .unwrap();
    test.close().unwrap();

    assert!(wait_until(|| journal.count("closed:") == 1).await);
    let events = journal.events();
    assert!(events.contains(&format!("check-ok:{}", good[0])), "{:?}", events);
    assert!(
        events.iter().any(|e| e.starts_with(&format!("check-fail:{}:", bad[0])) && e.contains("page crashed")),
        "{:?}",
        events
    );
}

#[tokio::test]
async fn stopped_coordinator_rejects_commands() {
    let sessions = Arc::new(FakeSessions::new());
    let renderer = Arc::new(FakeRenderer::new());
    let coordinator = start(&sessions, &renderer, 5);
    let journal = Journal::new();

    coordinator.stop();
    coordinator.join().await;

    assert!(!coordinator.is_running());
    let err = coordinator.open_test(start_info("late"), journal.clone()).err().unwrap();
    assert!(matches!(err, Error::Cancelled(_)));
}

/// Check listener that panics on success.
struct Exploding;

impl CheckListener for Exploding {
    fn on_complete(&self, _step_id: &str, _result: &MatchResult) {
        panic!("listener exploded");
    }

    fn on_fail(&self, _step_id: &str, _error: &Error) {}
}

#[tokio::test]
async fn panicking_listener_halts_the_coordinator_with_an_error() {
    let sessions = Arc::new(FakeSessions::new());
    let renderer = Arc::new(FakeRenderer::new());
    let coordinator = start(&sessions, &renderer, 5);
    let journal = Journal::new();

    let test = coordinator.open_test(start_info("panic"), journal.clone()).unwrap();
    coordinator
        .check(page("https://a.test/"), named("0"), &[&test], Arc::new(Exploding))
        .unwrap();

    assert!(wait_until(|| !coordinator.is_running()).await);
    coordinator.join().await;
    match coordinator.error() {
        Some(Error::Other(message)) => assert!(message.contains("listener exploded"), "{}", message),
        other => panic!("unexpected fault: {:?}", other),
    }
    assert!(matches!(test.close(), Err(Error::Cancelled(_))));
    assert!(matches!(
        coordinator.open_test(start_info("after"), journal.clone()),
        Err(Error::Cancelled(_))
    ));
}

#[tokio::test]
async fn test_aborted_while_opening_hears_no_open_callback() {
    let sessions = Arc::new(FakeSessions::new());
    *sessions.open_delay.lock().unwrap() = Some(Duration::from_millis(100));
    let renderer = Arc::new(FakeRenderer::new());
    let coordinator = start(&sessions, &renderer, 5);
    let journal = Journal::new();

    let test = coordinator.open_test(start_info("short-lived"), journal.clone()).unwrap();
    test.abort().unwrap();

    assert!(wait_until(|| journal.count("closed:") == 1).await);
    assert_eq!(journal.count("open:"), 0, "{:?}", journal.events());
    assert_eq!(*sessions.closes.lock().unwrap(), vec![(test.id().to_string(), true)]);
}

#[tokio::test]
async fn native_capture_is_rendered_without_collection() {
    let sessions = Arc::new(FakeSessions::new());
    let renderer = Arc::new(FakeRenderer::new());
    let coordinator = start(&sessions, &renderer, 5);
    let journal = Journal::new();

    let test = coordinator.open_test(start_info("native"), journal.clone()).unwrap();
    let steps = coordinator
        .check_native(vec![7; 64], "x-applitools-vhs/ios", CheckSettings::default(), &[&test], journal.clone())
        .unwrap();

    assert!(wait_until(|| journal.count("check-ok:") == 1).await);
    assert!(journal.events().contains(&format!("check-ok:{}", steps[0])));
    assert_eq!(*renderer.platforms.lock().unwrap(), vec![PlatformType::Native]);
    assert_eq!(*renderer.renderers.lock().unwrap(), vec![Some("renderer-native".to_string())]);
    // the capture was uploaded ahead of rendering
    assert_eq!(*renderer.batches.lock().unwrap(), vec![1]);
}
