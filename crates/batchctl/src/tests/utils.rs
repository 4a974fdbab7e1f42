use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::Backend;
use crate::common::parser::{NomResult, consume_all};
use crate::config::BackendConfig;
use crate::tests::runner::FakeRunner;

pub fn check_parse_error<'a, F: FnMut(&'a str) -> NomResult<'a, O>, O>(
    parser: F,
    input: &'a str,
    expected_error: &str,
) {
    match consume_all(parser, input) {
        Err(e) => {
            let output = format!("{e:?}");
            assert!(
                output.contains(expected_error),
                "`{output}` does not contain `{expected_error}`"
            );
        }
        _ => panic!("The parser should have failed"),
    }
}

pub fn test_config(output_dir: &Path) -> BackendConfig {
    BackendConfig {
        output_dir: output_dir.to_path_buf(),
        probe_timeout: Duration::from_millis(500),
        query_timeout: Duration::from_secs(5),
        immediate_wait: Duration::from_millis(200),
        kill_grace: Duration::from_millis(50),
        ..Default::default()
    }
}

pub fn create_backend(runner: &FakeRunner, output_dir: &Path) -> Backend {
    Backend::new(Arc::new(runner.clone()), test_config(output_dir))
}

pub fn temp_dir() -> tempfile::TempDir {
    tempfile::TempDir::with_prefix("batchctl").unwrap()
}
