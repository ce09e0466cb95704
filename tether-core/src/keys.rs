//! Cache key conventions.
//!
//! Keys are `:`-separated with the category first, so a whole category can be
//! invalidated by prefix.

/// Category of patient keys.
pub const PATIENT: &str = "patient";

/// Category of generic resource keys.
pub const RESOURCE: &str = "resource";

/// Prefix matching every key in `category`.
pub fn category_prefix(category: &str) -> String {
    format!("{category}:")
}

/// Key of a single patient.
pub fn patient(id: &str) -> String {
    format!("{PATIENT}:{id}")
}

/// Key of a patient search.
pub fn patient_search(query: &str) -> String {
    format!("{PATIENT}:search:{query}")
}

/// Key of the patient list.
pub fn patient_list() -> String {
    format!("{PATIENT}:list")
}

/// Key of a single resource.
pub fn resource(kind: &str, id: &str) -> String {
    format!("{RESOURCE}:{kind}:{id}")
}

/// Key of a resource list.
pub fn resource_list(kind: &str) -> String {
    format!("{RESOURCE}:{kind}:list")
}

/// Prefix matching every resource of `kind`.
pub fn resource_prefix(kind: &str) -> String {
    format!("{RESOURCE}:{kind}:")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_share_category_prefix() {
        let prefix = category_prefix(PATIENT);
        assert!(patient("42").starts_with(&prefix));
        assert!(patient_search("ada").starts_with(&prefix));
        assert!(patient_list().starts_with(&prefix));
        assert_eq!(patient_search("ada"), "patient:search:ada");
    }

    #[test]
    fn test_resource_keys() {
        assert_eq!(resource("Observation", "7"), "resource:Observation:7");
        assert!(resource_list("Observation").starts_with(&resource_prefix("Observation")));
        assert!(!resource("Encounter", "7").starts_with(&resource_prefix("Observation")));
    }
}
