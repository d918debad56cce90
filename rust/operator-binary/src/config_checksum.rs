//! Content hash over configuration objects, used as a pod template annotation to force rollouts.

use stackable_operator::{
    k8s_openapi::api::core::v1::{ConfigMap, Secret},
    kube::ResourceExt,
};

use crate::utils::sha256_hex;

/// The pod template annotation that carries the checksum.
pub const CHECKSUM_CONFIG_ANNOTATION: &str = "checksum/Config";

/// Lowercase hex SHA-256 over all entries of `config_maps` and `secrets`.
///
/// Objects are ordered by name and entries by key, so the result does not depend on the order of the inputs.
/// Metadata other than the name is not hashed.
pub fn calculate(config_maps: &[&ConfigMap], secrets: &[&Secret]) -> String {
    let mut config_maps = config_maps.to_vec();
    config_maps.sort_by_key(|cm| cm.name_any());
    let mut secrets = secrets.to_vec();
    secrets.sort_by_key(|secret| secret.name_any());

    // Every part is length-prefixed so that no two distinct entry sets share a byte stream
    let mut chunks: Vec<Vec<u8>> = Vec::new();
    let mut push_entry = |key: &str, value: &[u8]| {
        for part in [key.as_bytes(), value] {
            chunks.push((part.len() as u64).to_be_bytes().to_vec());
            chunks.push(part.to_vec());
        }
    };
    for cm in config_maps {
        push_entry("configmap", cm.name_any().as_bytes());
        for (key, value) in cm.data.iter().flatten() {
            push_entry(key, value.as_bytes());
        }
        for (key, value) in cm.binary_data.iter().flatten() {
            push_entry(key, &value.0);
        }
    }
    for secret in secrets {
        push_entry("secret", secret.name_any().as_bytes());
        for (key, value) in secret.data.iter().flatten() {
            push_entry(key, &value.0);
        }
    }
    sha256_hex(chunks.iter().map(Vec::as_slice))
}
