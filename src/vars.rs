//! Variable substitution for command and script templates.

use std::collections::BTreeMap;

/// Replace `${name}` and `$name` placeholders with values from `vars`.
///
/// Substitution is literal text replacement, not recursive expansion.
/// Unmatched placeholders are left verbatim by policy, so commands can still
/// reference shell variables the suite never declares. Iterating a
/// `BTreeMap` keeps replacement order deterministic for a fixed mapping.
///
/// # Examples
///
/// ```
/// let mut vars = std::collections::BTreeMap::new();
/// vars.insert("x".to_string(), "5".to_string());
/// assert_eq!(sifter::vars::substitute("echo ${x}", &vars), "echo 5");
/// assert_eq!(sifter::vars::substitute("echo $x", &vars), "echo 5");
/// ```
pub fn substitute(text: &str, vars: &BTreeMap<String, String>) -> String {
    if text.is_empty() {
        return String::new();
    }

    let mut result = text.to_string();
    for (key, value) in vars {
        result = result.replace(&format!("${{{key}}}"), value);
        result = result.replace(&format!("${key}"), value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_braced_and_bare_forms() {
        let vars = vars(&[("x", "5")]);
        assert_eq!(substitute("echo ${x}", &vars), "echo 5");
        assert_eq!(substitute("echo $x", &vars), "echo 5");
    }

    #[test]
    fn idempotent_without_placeholders() {
        let vars = vars(&[("x", "5")]);
        assert_eq!(substitute("echo hello", &vars), "echo hello");
        assert_eq!(substitute("", &vars), "");
    }

    #[test]
    fn unmatched_placeholders_left_verbatim() {
        let vars = vars(&[("x", "5")]);
        assert_eq!(substitute("echo ${missing}", &vars), "echo ${missing}");
        assert_eq!(substitute("echo $HOME", &vars), "echo $HOME");
    }

    #[test]
    fn multiple_occurrences_replaced() {
        let vars = vars(&[("input", "/data/a.nii"), ("output_dir", "/work/out")]);
        assert_eq!(
            substitute("cp ${input} ${output_dir}/b.nii && ls ${output_dir}", &vars),
            "cp /data/a.nii /work/out/b.nii && ls /work/out"
        );
    }

    #[test]
    fn substituted_values_are_not_rescanned_as_new_keys() {
        // "a" sorts before "b", so by the time $b is replaced its value
        // containing "$a" has no second pass over key "a".
        let vars = vars(&[("a", "1"), ("b", "$a")]);
        assert_eq!(substitute("$b", &vars), "$a");
    }

    #[test]
    fn deterministic_for_fixed_mapping() {
        let vars = vars(&[("out", "X"), ("output", "Y")]);
        let first = substitute("$out $output", &vars);
        for _ in 0..10 {
            assert_eq!(substitute("$out $output", &vars), first);
        }
    }
}
