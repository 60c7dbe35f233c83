use std::collections::HashMap;

/// Canonical key for an EventSub subscription: the type followed by its
/// condition pairs sorted by key. Empty condition values are left out since
/// listings report unused condition fields as `""`.
pub fn fingerprint(subscription_type: &str, condition: &HashMap<String, String>) -> String {
    let mut pairs: Vec<(&str, &str)> = condition
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    pairs.sort_unstable();

    let joined = pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    format!("{}|{}", subscription_type, joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn order_of_condition_keys_does_not_matter() {
        let keys = [
            ("broadcaster_user_id", "1"),
            ("moderator_user_id", "2"),
            ("reward_id", "abc"),
        ];
        let forward = condition(&keys);
        let mut reversed_keys = keys;
        reversed_keys.reverse();
        let reversed = condition(&reversed_keys);

        assert_eq!(
            fingerprint("channel.follow", &forward),
            fingerprint("channel.follow", &reversed)
        );
    }

    #[test]
    fn type_and_values_distinguish_fingerprints() {
        let c = condition(&[("broadcaster_user_id", "1")]);
        assert_ne!(
            fingerprint("channel.cheer", &c),
            fingerprint("channel.raid", &c)
        );
        assert_ne!(
            fingerprint("channel.cheer", &c),
            fingerprint("channel.cheer", &condition(&[("broadcaster_user_id", "2")]))
        );
    }

    #[test]
    fn empty_values_are_ignored() {
        let listed = condition(&[
            ("from_broadcaster_user_id", ""),
            ("to_broadcaster_user_id", "42"),
        ]);
        let desired = condition(&[("to_broadcaster_user_id", "42")]);
        assert_eq!(
            fingerprint("channel.raid", &listed),
            fingerprint("channel.raid", &desired)
        );
    }
}
