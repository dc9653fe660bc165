//! Build script for myrpc-runtime
//!
//! Generates `OUT_DIR/myrpc_config.rs` with the compile-time pool
//! defaults:
//! 1. Start with the library defaults below
//! 2. If MYRPC_CONFIG_RS names a file, read its `pub const` lines
//! 3. Values from that file win over the library defaults
//!
//! The user file only needs the values it changes.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

struct ConfigParam {
    name: &'static str,
    rust_type: &'static str,
    default_value: &'static str,
}

const CONFIG_PARAMS: &[ConfigParam] = &[
    ConfigParam {
        name: "NUM_WORKERS",
        rust_type: "usize",
        default_value: "4",
    },
    ConfigParam {
        name: "STACK_SIZE",
        rust_type: "usize",
        default_value: "256 * 1024",
    },
    ConfigParam {
        name: "READY_QUEUE_CAPACITY",
        rust_type: "usize",
        default_value: "16_384",
    },
    ConfigParam {
        name: "MAX_EVENTS",
        rust_type: "usize",
        default_value: "300",
    },
    ConfigParam {
        name: "WAIT_TIMEOUT_MS",
        rust_type: "u64",
        default_value: "5000",
    },
];

const USER_CONFIG_ENV: &str = "MYRPC_CONFIG_RS";

fn main() {
    let Ok(out_dir) = env::var("OUT_DIR") else {
        panic!("OUT_DIR not set by cargo");
    };
    let dest_path = Path::new(&out_dir).join("myrpc_config.rs");

    let mut config: HashMap<&'static str, String> = CONFIG_PARAMS
        .iter()
        .map(|p| (p.name, p.default_value.to_string()))
        .collect();

    let user_path = env::var(USER_CONFIG_ENV).ok();
    if let Some(path) = &user_path {
        println!("cargo:rerun-if-changed={}", path);
        match fs::read_to_string(path) {
            Ok(content) => {
                merge_user_config(&content, &mut config);
                println!("cargo:warning=Using custom config: {}", path);
            }
            Err(e) => {
                println!("cargo:warning=Failed to read {} ({}): {}", USER_CONFIG_ENV, path, e);
            }
        }
    }
    println!("cargo:rerun-if-env-changed={}", USER_CONFIG_ENV);

    let output = render(&config, user_path.is_some());
    if let Err(e) = fs::write(&dest_path, output) {
        panic!("failed to write {}: {}", dest_path.display(), e);
    }
}

/// Merge `pub const NAME: TYPE = VALUE;` lines over `config`.
/// Unknown names are reported and skipped.
fn merge_user_config(content: &str, config: &mut HashMap<&'static str, String>) {
    for line in content.lines().map(str::trim) {
        if line.starts_with("//") {
            continue;
        }
        let Some((name, value)) = parse_const_line(line) else {
            continue;
        };
        match CONFIG_PARAMS.iter().find(|p| p.name == name) {
            Some(param) => {
                config.insert(param.name, value);
            }
            None => println!("cargo:warning=Unknown config parameter: {}", name),
        }
    }
}

fn parse_const_line(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("pub const ")?.trim();
    let (name, rest) = rest.split_once(':')?;
    let (_ty, value) = rest.split_once('=')?;
    let value = value.trim().trim_end_matches(';').trim();
    Some((name.trim().to_string(), value.to_string()))
}

fn render(config: &HashMap<&'static str, String>, custom: bool) -> String {
    let mut output = String::from("// Auto-generated by build.rs - do not edit\n");
    if custom {
        output.push_str("// Library defaults merged with MYRPC_CONFIG_RS\n");
    }
    output.push('\n');

    for param in CONFIG_PARAMS {
        let value = config
            .get(param.name)
            .map(String::as_str)
            .unwrap_or(param.default_value);
        output.push_str(&format!(
            "pub const {}: {} = {};\n",
            param.name, param.rust_type, value
        ));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_const_line() {
        assert_eq!(
            parse_const_line("pub const NUM_WORKERS: usize = 8;"),
            Some(("NUM_WORKERS".into(), "8".into()))
        );
        assert_eq!(
            parse_const_line("pub const STACK_SIZE: usize = 1024 * 1024;"),
            Some(("STACK_SIZE".into(), "1024 * 1024".into()))
        );
        assert_eq!(parse_const_line("const X: u8 = 1;"), None);
    }

    #[test]
    fn test_merge_keeps_unmentioned_defaults() {
        let mut config: HashMap<&'static str, String> = CONFIG_PARAMS
            .iter()
            .map(|p| (p.name, p.default_value.to_string()))
            .collect();

        merge_user_config(
            "// tuning\npub const MAX_EVENTS: usize = 1024;\n",
            &mut config,
        );

        assert_eq!(config["MAX_EVENTS"], "1024");
        assert_eq!(config["WAIT_TIMEOUT_MS"], "5000");
    }
}
