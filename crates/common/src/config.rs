use std::collections::HashMap;
use std::env;

use crate::error::{AppError, AppResult};

pub fn env_map() -> HashMap<String, String> {
    env::vars().collect()
}

pub fn get(vars: &HashMap<String, String>, key: &str, default: &str) -> String {
    vars.get(key)
        .cloned()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

pub fn required(vars: &HashMap<String, String>, key: &str) -> AppResult<String> {
    vars.get(key)
        .cloned()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::Config(format!("missing required env var {key}")))
}

pub fn optional(vars: &HashMap<String, String>, key: &str) -> Option<String> {
    vars.get(key).cloned().filter(|v| !v.is_empty())
}

pub fn get_u64(vars: &HashMap<String, String>, key: &str, default: u64) -> AppResult<u64> {
    match vars.get(key).filter(|v| !v.is_empty()) {
        Some(raw) => raw
            .parse()
            .map_err(|_| AppError::Config(format!("{key} must be an integer, got {raw:?}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{get, get_u64, optional, required};

    #[test]
    fn get_falls_back_to_default() {
        let vars = HashMap::new();
        assert_eq!(get(&vars, "API_PORT", "8080"), "8080");
    }

    #[test]
    fn empty_values_are_treated_as_unset() {
        let mut vars = HashMap::new();
        vars.insert("ADMIN_TOKEN".to_string(), String::new());
        assert!(optional(&vars, "ADMIN_TOKEN").is_none());
        assert!(required(&vars, "ADMIN_TOKEN").is_err());
    }

    #[test]
    fn get_u64_rejects_garbage() {
        let mut vars = HashMap::new();
        vars.insert("RATE_LIMIT_RPS".to_string(), "lots".to_string());
        assert!(get_u64(&vars, "RATE_LIMIT_RPS", 100).is_err());

        vars.insert("RATE_LIMIT_RPS".to_string(), "250".to_string());
        assert_eq!(get_u64(&vars, "RATE_LIMIT_RPS", 100).expect("parse"), 250);
    }
}
