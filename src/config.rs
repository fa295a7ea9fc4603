use std::{env, num::NonZeroUsize, thread};

const DEFAULT_THREAD_PREFIX: &str = "taskgraph-worker";

/// Configuration entry-point for instantiating the executor.
///
/// `Default` sizes the pool to the available parallelism; `from_env` lets a
/// deployment override every field without recompiling.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Number of worker threads in the pool.
    pub num_workers: usize,
    /// Worker threads are named `{prefix}-{index}`.
    pub thread_name_prefix: String,
    /// Stack size of each worker. Deep chains of joined tasks recurse on
    /// the worker stack, so very deep graphs may need more than the default.
    pub stack_size: Option<usize>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            num_workers: thread::available_parallelism().map_or(1, NonZeroUsize::get),
            thread_name_prefix: DEFAULT_THREAD_PREFIX.to_owned(),
            stack_size: None,
        }
    }
}

impl ExecutorConfig {
    /// Build a config from the defaults overridden by environment variables:
    /// `TASKGRAPH_NUM_WORKERS`, `TASKGRAPH_THREAD_PREFIX`, `TASKGRAPH_STACK_SIZE`.
    ///
    /// Unparsable numbers fall back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            num_workers: env_parse("TASKGRAPH_NUM_WORKERS").unwrap_or(defaults.num_workers),
            thread_name_prefix: env_opt("TASKGRAPH_THREAD_PREFIX")
                .unwrap_or(defaults.thread_name_prefix),
            stack_size: env_parse("TASKGRAPH_STACK_SIZE").or(defaults.stack_size),
        }
    }

    /// Set the number of worker threads.
    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Set the worker thread name prefix.
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Set the worker stack size in bytes.
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse(key: &str) -> Option<usize> {
    env_opt(key).and_then(|v| parse_usize(&v))
}

fn parse_usize(value: &str) -> Option<usize> {
    value.trim().replace('_', "").parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_at_least_one_worker() {
        let config = ExecutorConfig::default();
        assert!(config.num_workers >= 1);
        assert_eq!(config.thread_name_prefix, DEFAULT_THREAD_PREFIX);
        assert_eq!(config.stack_size, None);
    }

    #[test]
    fn builder_overrides_fields() {
        let config = ExecutorConfig::default()
            .with_num_workers(3)
            .with_thread_name_prefix("matmul")
            .with_stack_size(8 << 20);
        assert_eq!(config.num_workers, 3);
        assert_eq!(config.thread_name_prefix, "matmul");
        assert_eq!(config.stack_size, Some(8 << 20));
    }

    #[test]
    fn parses_numbers_leniently() {
        assert_eq!(parse_usize(" 4 "), Some(4));
        assert_eq!(parse_usize("16_777_216"), Some(16_777_216));
        assert_eq!(parse_usize("four"), None);
        assert_eq!(parse_usize("-1"), None);
    }

    #[test]
    fn from_env_overrides_and_falls_back() {
        const KEYS: [&str; 3] = [
            "TASKGRAPH_NUM_WORKERS",
            "TASKGRAPH_THREAD_PREFIX",
            "TASKGRAPH_STACK_SIZE",
        ];
        // SAFETY: no other test reads or writes the TASKGRAPH_* variables.
        let set = |key: &str, value: &str| unsafe { env::set_var(key, value) };
        let clear = || KEYS.iter().for_each(|key| unsafe { env::remove_var(key) });

        clear();
        assert_eq!(ExecutorConfig::from_env(), ExecutorConfig::default());

        set("TASKGRAPH_NUM_WORKERS", "3");
        set("TASKGRAPH_THREAD_PREFIX", "render");
        set("TASKGRAPH_STACK_SIZE", "1_048_576");
        let config = ExecutorConfig::from_env();
        assert_eq!(config.num_workers, 3);
        assert_eq!(config.thread_name_prefix, "render");
        assert_eq!(config.stack_size, Some(1 << 20));

        set("TASKGRAPH_NUM_WORKERS", "many");
        set("TASKGRAPH_THREAD_PREFIX", "");
        set("TASKGRAPH_STACK_SIZE", "-8");
        let config = ExecutorConfig::from_env();
        let defaults = ExecutorConfig::default();
        assert_eq!(config.num_workers, defaults.num_workers);
        assert_eq!(config.thread_name_prefix, DEFAULT_THREAD_PREFIX);
        assert_eq!(config.stack_size, None);

        clear();
    }
}
