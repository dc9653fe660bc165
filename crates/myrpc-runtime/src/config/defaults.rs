//! Compile-time defaults, generated by build.rs (see MYRPC_CONFIG_RS)

include!(concat!(env!("OUT_DIR"), "/myrpc_config.rs"));
