mod common;

use cloudengine_core_k8s::{
    client::{ClientError, MemoryClient, MemoryStats, ObjectClient},
    name::NamespacedName,
    singleton::{EnsureError, Ensured, Singleton, SingletonEnsurer},
};
use tokio::join;

use self::common::{fast_retry, fatal, scheme, settings, transient, GadgetCrd, SettingsCrd};

fn setup(max_attempts: u32) -> (MemoryClient, SingletonEnsurer<MemoryClient>) {
    ::cloudengine_core::tracer::init_once_for_tests();

    let client = MemoryClient::new(scheme());
    let ensurer = SingletonEnsurer::with_retry(client.clone(), fast_retry(max_attempts));
    (client, ensurer)
}

#[tokio::test]
async fn creates_the_singleton_when_absent() {
    let (client, ensurer) = setup(3);

    let ensured = ensurer.ensure_exists::<SettingsCrd>().await.unwrap();
    assert_eq!(ensured, Ensured::Created);

    let stored: SettingsCrd = client
        .get(&SettingsCrd::well_known_name())
        .await
        .unwrap();
    assert_eq!(stored.metadata.name.as_deref(), Some("settings"));
    assert_eq!(stored.metadata.namespace.as_deref(), Some("default"));
    assert_eq!(stored.spec.revision, 1);
    assert!(stored.metadata.uid.is_some());
    assert_eq!(client.stats().creates, 1);
}

#[tokio::test]
async fn leaves_an_existing_singleton_untouched() {
    let (client, ensurer) = setup(3);
    client.insert(&settings(7)).unwrap();

    let ensured = ensurer.ensure_exists::<SettingsCrd>().await.unwrap();
    assert_eq!(ensured, Ensured::Found);
    assert_eq!(
        client.stats(),
        MemoryStats {
            gets: 1,
            create_attempts: 0,
            creates: 0,
        },
    );

    let stored: SettingsCrd = client
        .get(&SettingsCrd::well_known_name())
        .await
        .unwrap();
    assert_eq!(stored.spec.revision, 7);
}

#[tokio::test]
async fn repeated_calls_issue_no_further_creates() {
    let (client, ensurer) = setup(3);

    assert_eq!(
        ensurer.ensure_exists::<SettingsCrd>().await.unwrap(),
        Ensured::Created,
    );
    for _ in 0..3 {
        assert_eq!(
            ensurer.ensure_exists::<SettingsCrd>().await.unwrap(),
            Ensured::Found,
        );
    }
    assert_eq!(client.stats().create_attempts, 1);
}

#[tokio::test]
async fn transient_get_failures_are_not_taken_as_absence() {
    let (client, ensurer) = setup(5);
    client.insert(&settings(3)).unwrap();
    client.fail_gets([transient(), transient()]);

    let ensured = ensurer.ensure_exists::<SettingsCrd>().await.unwrap();
    assert_eq!(ensured, Ensured::Found);
    assert_eq!(client.stats().gets, 3);
    assert_eq!(client.stats().create_attempts, 0);
}

#[tokio::test]
async fn transient_get_failures_exhaust_the_retry_budget() {
    let (client, ensurer) = setup(3);
    client.fail_gets([transient(), transient(), transient()]);

    let error = ensurer.ensure_exists::<SettingsCrd>().await.unwrap_err();
    match error {
        EnsureError::Exhausted {
            attempts, source, ..
        } => {
            assert_eq!(attempts, 3);
            assert!(source.is_transient());
        }
        error => panic!("unexpected error: {error}"),
    }
    assert_eq!(client.stats().gets, 3);
    assert_eq!(client.stats().create_attempts, 0);
}

#[tokio::test]
async fn fatal_get_failure_propagates_without_retrying() {
    let (client, ensurer) = setup(5);
    client.fail_gets([fatal()]);

    let error = ensurer.ensure_exists::<SettingsCrd>().await.unwrap_err();
    assert!(matches!(error, EnsureError::Get { .. }), "{error}");
    assert_eq!(client.stats().gets, 1);
    assert_eq!(client.stats().create_attempts, 0);
}

#[tokio::test]
async fn fatal_create_failure_propagates() {
    let (client, ensurer) = setup(5);
    client.fail_creates([fatal()]);

    let error = ensurer.ensure_exists::<SettingsCrd>().await.unwrap_err();
    assert!(matches!(error, EnsureError::Create { .. }), "{error}");
    assert!(!client.contains::<SettingsCrd>(&SettingsCrd::well_known_name()));
    assert_eq!(client.stats().creates, 0);
}

#[tokio::test]
async fn transient_create_failure_rereads_before_creating_again() {
    let (client, ensurer) = setup(5);
    client.fail_creates([transient()]);

    let ensured = ensurer.ensure_exists::<SettingsCrd>().await.unwrap();
    assert_eq!(ensured, Ensured::Created);
    assert_eq!(
        client.stats(),
        MemoryStats {
            gets: 2,
            create_attempts: 2,
            creates: 1,
        },
    );
}

#[tokio::test]
async fn unregistered_kinds_are_rejected() {
    let (client, _) = setup(1);

    let error = client
        .get::<GadgetCrd>(&NamespacedName::cluster("blue"))
        .await
        .unwrap_err();
    assert!(matches!(error, ClientError::Scheme(_)), "{error}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_racing_callers_create_exactly_once() {
    let (client, ensurer) = setup(3);
    client.synchronize_gets(2);

    let peer = SingletonEnsurer::with_retry(client.clone(), fast_retry(3));
    let (left, right) = join!(
        ensurer.ensure_exists::<SettingsCrd>(),
        peer.ensure_exists::<SettingsCrd>(),
    );

    let mut outcomes = vec![left.unwrap(), right.unwrap()];
    outcomes.sort_by_key(|ensured| *ensured as u8);
    assert_eq!(outcomes, [Ensured::Created, Ensured::CreatedByPeer]);
    assert_eq!(
        client.stats(),
        MemoryStats {
            gets: 2,
            create_attempts: 2,
            creates: 1,
        },
    );
}
