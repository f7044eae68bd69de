//! Environment variable utilities
//!
//! Configuration is read from `URDMA_*` environment variables. These
//! helpers parse a variable into any `FromStr` type and fall back to a
//! default when the variable is unset or does not parse.
//!
//! # Usage
//!
//! ```ignore
//! use urdma_core::env::{env_get, env_get_bool};
//!
//! let max_qp: u16 = env_get("URDMA_MAX_QP", 63);
//! let fdir = env_get_bool("URDMA_FDIR", false);
//! ```

use std::str::FromStr;

use tracing::warn;

/// Parsed value of `key`, or `default` if unset or unparsable
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Boolean switch: `1/true/yes/on` or `0/false/no/off`, any case
///
/// Anything else is reported and treated as unset.
pub fn env_get_bool(key: &str, default: bool) -> bool {
    let Ok(val) = std::env::var(key) else {
        return default;
    };
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => {
            warn!(key, value = %val, default, "not a boolean, using default");
            default
        }
    }
}

/// Parsed value of `key`; `None` if unset or unparsable
///
/// A set value that does not parse is reported, so a typo in a
/// deployment does not silently fall back to the default.
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    let val = std::env::var(key).ok()?;
    match val.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %val, "cannot parse, ignoring");
            None
        }
    }
}

/// String value of `key`, or `default`
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: u16 = env_get("__URDMA_TEST_UNSET__", 63);
        assert_eq!(val, 63);
        assert!(env_get_bool("__URDMA_TEST_UNSET__", true));
        assert!(env_get_opt::<u32>("__URDMA_TEST_UNSET__").is_none());
        assert_eq!(env_get_str("__URDMA_TEST_UNSET__", "/dev/urdma"), "/dev/urdma");
    }

    #[test]
    fn test_env_get_with_set_var() {
        std::env::set_var("__URDMA_TEST_NUM__", " 123 ");
        let val: u32 = env_get("__URDMA_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__URDMA_TEST_NUM__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        for v in ["1", "true", "TRUE", "yes", "on"] {
            std::env::set_var("__URDMA_TEST_BOOL__", v);
            assert!(env_get_bool("__URDMA_TEST_BOOL__", false), "{}", v);
        }
        for v in ["0", "false", "Off", "no"] {
            std::env::set_var("__URDMA_TEST_BOOL__", v);
            assert!(!env_get_bool("__URDMA_TEST_BOOL__", true), "{}", v);
        }
        // Unrecognized values keep the default
        std::env::set_var("__URDMA_TEST_BOOL__", "garbage");
        assert!(env_get_bool("__URDMA_TEST_BOOL__", true));
        assert!(!env_get_bool("__URDMA_TEST_BOOL__", false));
        std::env::remove_var("__URDMA_TEST_BOOL__");
    }

    #[test]
    fn test_env_get_invalid_parse() {
        std::env::set_var("__URDMA_TEST_INVALID__", "not_a_number");
        let val: usize = env_get("__URDMA_TEST_INVALID__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__URDMA_TEST_INVALID__");
    }
}
