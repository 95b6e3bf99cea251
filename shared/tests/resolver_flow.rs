mod common;

use common::{capabilities, config, FakeBackend};
use portal_shared::capabilities::{KeyValueStore, StorageKey};
use portal_shared::resolver::CandidateSource;
use portal_shared::{ApiError, EndpointResolver, PortalClient, ResolveError};
use std::sync::Arc;

#[tokio::test]
async fn skips_unreachable_candidate_and_persists_winner() {
    let backend = Arc::new(FakeBackend::new().reachable("192.168.1.16"));
    let (caps, kv) = capabilities(&backend);
    let candidates = config(&["10.0.0.5", "192.168.1.16", "192.168.1.17"]);
    let resolver = EndpointResolver::new(&caps, candidates).unwrap();

    let endpoint = resolver.resolve().await.unwrap();

    assert_eq!(endpoint.base_url, "http://192.168.1.16:5000");
    assert_eq!(endpoint.source, CandidateSource::CommonAddress);
    assert_eq!(backend.probed_hosts(), vec!["10.0.0.5", "192.168.1.16"]);
    assert_eq!(
        kv.get(StorageKey::LastWorkingIp).await.unwrap().as_deref(),
        Some("192.168.1.16")
    );
}

#[tokio::test]
async fn next_launch_starts_from_last_working_host() {
    let backend = Arc::new(FakeBackend::new().reachable("192.168.1.16"));
    let (caps, _) = capabilities(&backend);
    let hosts = ["10.0.0.5", "192.168.1.16"];

    EndpointResolver::new(&caps, config(&hosts))
        .unwrap()
        .resolve()
        .await
        .unwrap();
    let relaunched = EndpointResolver::new(&caps, config(&hosts)).unwrap();
    let endpoint = relaunched.resolve().await.unwrap();

    assert_eq!(endpoint.source, CandidateSource::LastKnownGood);
    assert_eq!(
        backend.probed_hosts(),
        vec!["10.0.0.5", "192.168.1.16", "192.168.1.16"]
    );
}

#[tokio::test]
async fn concurrent_callers_share_one_discovery() {
    let backend = Arc::new(FakeBackend::new().reachable("192.168.1.16"));
    let (caps, _) = capabilities(&backend);
    let candidates = config(&["10.0.0.5", "192.168.1.16"]);
    let resolver = Arc::new(EndpointResolver::new(&caps, candidates).unwrap());

    let (a, b, c) = tokio::join!(resolver.resolve(), resolver.resolve(), resolver.resolve());

    assert_eq!(a.unwrap(), b.clone().unwrap());
    assert_eq!(b.unwrap(), c.unwrap());
    assert_eq!(backend.probed_hosts().len(), 2);
    assert_eq!(resolver.metrics().discoveries, 1);
}

#[tokio::test]
async fn lost_server_is_rediscovered_elsewhere() {
    let backend = Arc::new(
        FakeBackend::new()
            .reachable("192.168.1.16")
            .with_user("awa@example.com", "secret1", "Awa", "Diop"),
    );
    let (caps, _) = capabilities(&backend);
    let client = PortalClient::new(&caps, config(&["192.168.1.16", "192.168.1.17"])).unwrap();
    client.auth().login("awa@example.com", "secret1").await.unwrap();

    backend.set_reachable("192.168.1.16", false);
    assert!(matches!(
        client.profile().fetch_profile().await,
        Err(ApiError::NetworkUnavailable)
    ));
    assert!(client.resolver().cached().await.is_none());

    backend.set_reachable("192.168.1.17", true);
    let profile = client.profile().fetch_profile().await.unwrap();
    assert_eq!(profile.email, "awa@example.com");
    assert_eq!(
        client.resolver().base_url().await.unwrap(),
        "http://192.168.1.17:5000"
    );
}

#[tokio::test]
async fn nothing_reachable_reports_every_attempt() {
    let backend = Arc::new(FakeBackend::new());
    let (caps, _) = capabilities(&backend);
    let resolver = EndpointResolver::new(&caps, config(&["10.0.0.5", "10.0.0.6"])).unwrap();

    assert!(matches!(
        resolver.resolve().await,
        Err(ResolveError::NoServerFound { attempted: 2 })
    ));
}
