mod common;

use cloudengine_core_k8s::{
    client::MemoryClient,
    singleton::{Ensured, SingletonEnsurer},
};
use proptest::prelude::*;
use tokio::runtime::Builder;

use self::common::{fast_retry, scheme, settings, SettingsCrd};

fn race(callers: usize, synchronized: bool, present: bool) -> (MemoryClient, Vec<Ensured>) {
    let runtime = Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();

    let client = MemoryClient::new(scheme());
    if present {
        client.insert(&settings(2)).unwrap();
    }
    if synchronized {
        client.synchronize_gets(callers);
    }

    let outcomes = runtime.block_on(async {
        let tasks: Vec<_> = (0..callers)
            .map(|_| {
                let ensurer = SingletonEnsurer::with_retry(client.clone(), fast_retry(3));
                ::tokio::spawn(async move { ensurer.ensure_exists::<SettingsCrd>().await })
            })
            .collect();

        let mut outcomes = Vec::with_capacity(callers);
        for task in tasks {
            outcomes.push(task.await.unwrap().unwrap());
        }
        outcomes
    });
    (client, outcomes)
}

fn count(outcomes: &[Ensured], expected: Ensured) -> usize {
    outcomes.iter().filter(|&&ensured| ensured == expected).count()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn concurrent_callers_create_at_most_once(
        callers in 1usize..12,
        synchronized in any::<bool>(),
        present in any::<bool>(),
    ) {
        let (client, outcomes) = race(callers, synchronized, present);
        let stats = client.stats();

        prop_assert_eq!(outcomes.len(), callers);
        if present {
            prop_assert_eq!(count(&outcomes, Ensured::Found), callers);
            prop_assert_eq!(stats.create_attempts, 0);
        } else {
            prop_assert_eq!(count(&outcomes, Ensured::Created), 1);
            prop_assert_eq!(stats.creates, 1);
            if synchronized {
                // every caller saw the object missing
                prop_assert_eq!(count(&outcomes, Ensured::CreatedByPeer), callers - 1);
                prop_assert_eq!(stats.create_attempts, callers);
            }
        }
    }
}
