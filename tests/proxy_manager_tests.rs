use chrono::Utc;
use novel_crawler::models::{ProxyConfig, ProxyProtocol, ProxyStateUpdate};
use novel_crawler::proxy_manager::{ProxyManager, ProxyManagerOptions};
use novel_crawler::proxy_store::ProxyStore;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn proxy_a() -> ProxyConfig {
    ProxyConfig::new(ProxyProtocol::Http, "proxy.test", 8080)
}

fn proxy_b() -> ProxyConfig {
    ProxyConfig::new(ProxyProtocol::Http, "proxy-b.test", 8081)
}

fn manager_with(fail_threshold: u32, cooldown: Duration) -> ProxyManager {
    let store = Arc::new(ProxyStore::open_in_memory().expect("open store"));
    ProxyManager::new(
        store,
        ProxyManagerOptions {
            fail_threshold,
            cooldown,
            default_proxies: Vec::new(),
        },
    )
    .expect("create manager")
}

#[tokio::test]
async fn test_cooldown_and_recovery() {
    let manager = manager_with(1, Duration::from_millis(20));
    let a = manager.add(&proxy_a()).unwrap();

    let picked = manager.pick().unwrap().expect("proxy available");
    assert_eq!(picked.id, a.id);
    assert!(picked.last_used_at.is_some());

    manager.report_result(a.id, false).unwrap();
    assert!(manager.pick().unwrap().is_none(), "cooling proxy must not be picked");

    tokio::time::sleep(Duration::from_millis(30)).await;

    let recovered = manager.pick().unwrap().expect("proxy back after cooldown");
    assert_eq!(recovered.id, a.id);
    assert_eq!(recovered.fail_count, 0);
    assert!(recovered.cooldown_until.is_none());
}

#[test]
fn test_both_proxies_get_picked() {
    let manager = manager_with(3, Duration::from_secs(300));
    let a = manager.add(&proxy_a()).unwrap();
    let b = manager.add(&proxy_b()).unwrap();

    // Equal weights: a miss over 40 picks has probability 2^-39.
    let mut seen = HashSet::new();
    for _ in 0..40 {
        let picked = manager.pick().unwrap().unwrap();
        manager.report_result(picked.id, true).unwrap();
        seen.insert(picked.id);
    }
    assert!(seen.contains(&a.id));
    assert!(seen.contains(&b.id));
}

#[test]
fn test_success_resets_failures() {
    let manager = manager_with(3, Duration::from_secs(300));
    let a = manager.add(&proxy_a()).unwrap();

    manager.report_result(a.id, false).unwrap();
    manager.report_result(a.id, false).unwrap();
    let state = manager.store().get_by_id(a.id).unwrap().unwrap();
    assert_eq!(state.fail_count, 2);
    assert!(state.cooldown_until.is_none());

    manager.report_result(a.id, true).unwrap();
    let state = manager.store().get_by_id(a.id).unwrap().unwrap();
    assert_eq!(state.fail_count, 0);
    assert_eq!(state.success_count, 1);
    assert!(state.cooldown_until.is_none());
}

#[test]
fn test_threshold_starts_cooldown_and_success_clears_it() {
    let manager = manager_with(3, Duration::from_secs(300));
    let a = manager.add(&proxy_a()).unwrap();

    for _ in 0..3 {
        manager.report_result(a.id, false).unwrap();
    }
    let state = manager.store().get_by_id(a.id).unwrap().unwrap();
    assert!(state.is_cooling_down());
    assert!(manager.pick().unwrap().is_none());

    manager.report_result(a.id, true).unwrap();
    let state = manager.store().get_by_id(a.id).unwrap().unwrap();
    assert!(!state.is_cooling_down());
    assert_eq!(manager.pick().unwrap().unwrap().id, a.id);
}

#[test]
fn test_report_for_unknown_id_is_noop() {
    let manager = manager_with(3, Duration::from_secs(300));
    let a = manager.add(&proxy_a()).unwrap();
    let before = manager.list().unwrap();

    manager.report_result(9999, true).unwrap();
    manager.report_result(9999, false).unwrap();

    assert_eq!(manager.list().unwrap(), before);
    assert_eq!(manager.store().get_by_id(a.id).unwrap().unwrap().success_count, 0);
}

#[test]
fn test_add_is_idempotent_and_keeps_counters() {
    let manager = manager_with(3, Duration::from_secs(300));
    let first = manager.add(&proxy_a()).unwrap();
    manager.report_result(first.id, true).unwrap();
    manager.report_result(first.id, false).unwrap();

    let again = manager
        .add(&proxy_a().with_credentials("someone", Some("secret")))
        .unwrap();
    assert_eq!(again.id, first.id);
    assert_eq!(again.success_count, 1);
    assert_eq!(again.fail_count, 1);
    assert_eq!(manager.list().unwrap().len(), 1);
}

#[test]
fn test_invalid_config_rejected() {
    let manager = manager_with(3, Duration::from_secs(300));
    let err = manager
        .add(&ProxyConfig::new(ProxyProtocol::Http, "", 0))
        .unwrap_err();
    assert!(err.to_string().starts_with("Invalid proxy configuration"));
    assert!(manager.list().unwrap().is_empty());
}

#[test]
fn test_hosts_that_break_the_proxy_url_are_rejected() {
    let manager = manager_with(3, Duration::from_secs(300));
    for host in ["bad:host", "a?b"] {
        let err = manager
            .add(&ProxyConfig::new(ProxyProtocol::Http, host, 8080))
            .unwrap_err();
        assert!(err.to_string().contains("invalid host"), "{}", err);
    }
    let v6 = manager
        .add(&ProxyConfig::new(ProxyProtocol::Http, "::1", 8080))
        .unwrap();
    assert_eq!(v6.config.proxy_url(), "http://[::1]:8080");
    assert_eq!(manager.list().unwrap().len(), 1);
}

#[test]
fn test_failure_after_expired_cooldown_is_not_undone_by_pick() {
    let manager = manager_with(1, Duration::from_secs(300));
    let a = manager.add(&proxy_a()).unwrap();
    let expired = ProxyStateUpdate {
        fail_count: Some(1),
        cooldown_until: Some(Some(Utc::now().timestamp_millis() - 1)),
        ..Default::default()
    };
    manager.store().update_state(a.id, &expired).unwrap();

    manager.report_result(a.id, false).unwrap();

    assert!(manager.pick().unwrap().is_none());
    let stored = manager.store().get_by_id(a.id).unwrap().unwrap();
    assert_eq!(stored.fail_count, 2);
    assert!(stored.cooldown_until.unwrap() > Utc::now().timestamp_millis());
}

#[test]
fn test_zero_fail_threshold_is_an_error() {
    let store = Arc::new(ProxyStore::open_in_memory().unwrap());
    let options = ProxyManagerOptions {
        fail_threshold: 0,
        ..Default::default()
    };
    assert!(ProxyManager::new(store, options).is_err());
}

#[test]
fn test_default_proxies_registered_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("proxies.db");
    let options = ProxyManagerOptions {
        default_proxies: vec![proxy_a(), proxy_b()],
        ..Default::default()
    };

    {
        let store = Arc::new(ProxyStore::open(&path).unwrap());
        let manager = ProxyManager::new(store.clone(), options.clone()).unwrap();
        let a = manager.list().unwrap()[0].clone();
        manager.report_result(a.id, true).unwrap();
        store.close().unwrap();
    }

    let store = Arc::new(ProxyStore::open(&path).unwrap());
    let manager = ProxyManager::new(store, options).unwrap();
    let proxies = manager.list().unwrap();
    assert_eq!(proxies.len(), 2);
    assert_eq!(proxies[0].success_count, 1, "restart must keep health counters");
}

#[test]
fn test_remove_excludes_from_pick() {
    let manager = manager_with(3, Duration::from_secs(300));
    let a = manager.add(&proxy_a()).unwrap();
    manager.remove(a.id).unwrap();
    manager.remove(a.id).unwrap();
    assert!(manager.pick().unwrap().is_none());
}

#[test]
fn test_concurrent_reports_are_not_lost() {
    let manager = Arc::new(manager_with(1_000, Duration::from_secs(300)));
    let a = manager.add(&proxy_a()).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            std::thread::spawn(move || {
                for _ in 0..25 {
                    manager.report_result(a.id, true).unwrap();
                    manager.pick().unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let state = manager.store().get_by_id(a.id).unwrap().unwrap();
    assert_eq!(state.success_count, 200);
}
