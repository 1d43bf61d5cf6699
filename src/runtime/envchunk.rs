//! Chunked environment-variable transport for serialized configurations
//!
//! This is purely a transport concern: a detached supervisor cannot
//! inherit an open configuration socket across setsid/exec in every
//! deployment, so the serialized configuration is split across a bounded
//! number of environment variables, with a trailing chunk-count variable.
//! Chunk sizing stays under both the kernel's per-string cap and the
//! RLIMIT_STACK-derived total argument/environment budget.

use crate::errors::RuntimeError;

// The kernel caps a single argv/env string at 32 pages
const MAX_ENV_STRLEN: usize = 32 * 4096;
const CHUNK_HEADROOM: usize = 1024;

fn chunk_len() -> usize {
    MAX_ENV_STRLEN - CHUNK_HEADROOM
}

/// Total payload budget: the kernel allows argv+envp up to a quarter of
/// the stack limit; claim at most half of that for the configuration
fn payload_budget() -> usize {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_STACK, &mut limit) } != 0 {
        return 8 * 1024 * 1024 / 8;
    }
    (limit.rlim_cur as usize / 4) / 2
}

/// Split a payload into `PREFIX_0..PREFIX_{n-1}` variables plus a
/// trailing `PREFIX_COUNT`
pub fn to_env(prefix: &str, payload: &[u8]) -> Result<Vec<(String, String)>, RuntimeError> {
    chunked(prefix, payload, chunk_len(), payload_budget())
}

fn chunked(
    prefix: &str,
    payload: &[u8],
    chunk_len: usize,
    budget: usize,
) -> Result<Vec<(String, String)>, RuntimeError> {
    if payload.len() > budget {
        return Err(RuntimeError::ConfigTooLarge);
    }
    let text = std::str::from_utf8(payload).map_err(|_| RuntimeError::ConfigTooLarge)?;
    if text.contains('\0') {
        return Err(RuntimeError::ConfigTooLarge);
    }

    let mut vars = Vec::new();
    let mut index = 0;
    let mut rest = text;
    while !rest.is_empty() {
        let mut split = chunk_len.min(rest.len());
        while !rest.is_char_boundary(split) {
            split -= 1;
        }
        let (chunk, remainder) = rest.split_at(split);
        vars.push((format!("{}_{}", prefix, index), chunk.to_string()));
        index += 1;
        rest = remainder;
    }
    vars.push((format!("{}_COUNT", prefix), index.to_string()));
    Ok(vars)
}

/// Reassemble a payload previously split by `to_env`, reading the
/// current process environment
pub fn from_env(prefix: &str) -> Result<Vec<u8>, RuntimeError> {
    from_lookup(prefix, |name| std::env::var(name).ok())
}

fn from_lookup<F>(prefix: &str, lookup: F) -> Result<Vec<u8>, RuntimeError>
where
    F: Fn(&str) -> Option<String>,
{
    let count: usize = lookup(&format!("{}_COUNT", prefix))
        .and_then(|value| value.parse().ok())
        .ok_or(RuntimeError::BadEnvironment("config chunk count"))?;

    let mut payload = String::new();
    for index in 0..count {
        let chunk = lookup(&format!("{}_{}", prefix, index))
            .ok_or(RuntimeError::BadEnvironment("config chunk"))?;
        payload.push_str(&chunk);
    }
    Ok(payload.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn round_trip(payload: &[u8], chunk_len: usize) -> Vec<u8> {
        let vars = chunked("TEST_CONFIG", payload, chunk_len, usize::max_value()).unwrap();
        let map: HashMap<String, String> = vars.into_iter().collect();
        from_lookup("TEST_CONFIG", |name| map.get(name).cloned()).unwrap()
    }

    #[test]
    fn small_payload_is_one_chunk() {
        let vars = chunked("TEST_CONFIG", b"{}", 100, 1000).unwrap();
        assert_eq!(
            vars,
            vec![
                ("TEST_CONFIG_0".to_string(), "{}".to_string()),
                ("TEST_CONFIG_COUNT".to_string(), "1".to_string()),
            ]
        );
    }

    #[test]
    fn long_payload_splits_and_reassembles() {
        let payload: String = std::iter::repeat("configuration!").take(100).collect();
        assert_eq!(round_trip(payload.as_bytes(), 64), payload.as_bytes());
        assert_eq!(round_trip(payload.as_bytes(), 7), payload.as_bytes());
    }

    #[test]
    fn multibyte_characters_stay_intact() {
        let payload = "π configuration π".repeat(20);
        assert_eq!(round_trip(payload.as_bytes(), 5), payload.as_bytes());
    }

    #[test]
    fn over_budget_is_refused() {
        let payload = vec![b'x'; 100];
        assert!(matches!(
            chunked("TEST_CONFIG", &payload, 10, 50),
            Err(RuntimeError::ConfigTooLarge)
        ));
    }

    #[test]
    fn missing_chunk_is_an_error() {
        let vars = chunked("TEST_CONFIG", b"abcdef", 2, 1000).unwrap();
        let mut map: HashMap<String, String> = vars.into_iter().collect();
        map.remove("TEST_CONFIG_1");
        assert!(matches!(
            from_lookup("TEST_CONFIG", |name| map.get(name).cloned()),
            Err(RuntimeError::BadEnvironment(_))
        ));
    }
}
