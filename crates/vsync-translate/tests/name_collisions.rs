//! Randomized checks that distinct virtual coordinates never share a host name

use std::collections::HashMap;
use std::sync::Arc;

use kube::discovery::Scope;
use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vsync_common::{ObjectKey, SyncConfig, MAX_NAME_LENGTH};
use vsync_translate::NameTranslator;

const SAMPLES: usize = 10_000;

fn translator() -> NameTranslator {
    NameTranslator::new(Arc::new(
        SyncConfig::builder("tenant", "team-a").build().unwrap(),
    ))
}

fn dns_name(rng: &mut StdRng, len: usize) -> String {
    let body: String = rng
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("n{body}")
}

#[test]
fn long_names_map_to_distinct_host_names() {
    let names = translator();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut seen: HashMap<String, ObjectKey> = HashMap::new();

    for _ in 0..SAMPLES {
        let name_len = rng.gen_range(40..250);
        let ns_len = rng.gen_range(5..60);
        let key = ObjectKey::namespaced(dns_name(&mut rng, ns_len), dns_name(&mut rng, name_len));
        let host = names.host_key(&key, &Scope::Namespaced);

        assert!(host.name.len() <= MAX_NAME_LENGTH, "{} is too long", host.name);
        if let Some(previous) = seen.insert(host.name.clone(), key.clone()) {
            assert_eq!(previous, key, "{previous} and {key} collide on {}", host.name);
        }
    }
}

/// Names sharing a long prefix differ only past the truncation point
#[test]
fn shared_prefixes_do_not_collide() {
    let names = translator();
    let prefix = "a".repeat(120);
    let mut seen = HashMap::new();

    for i in 0..SAMPLES {
        let name = format!("{prefix}{i}");
        let host = names.host_name(&name, "default");
        assert!(host.len() <= MAX_NAME_LENGTH);
        assert!(seen.insert(host, name).is_none());
    }
}

#[test]
fn mapping_is_stable() {
    let names = translator();
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..100 {
        let name = dns_name(&mut rng, 90);
        assert_eq!(names.host_name(&name, "prod"), translator().host_name(&name, "prod"));
    }
}
