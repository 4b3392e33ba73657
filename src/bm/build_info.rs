pub fn build_time() -> &'static str {
    option_env!("BM2_BUILD_TIME").unwrap_or("unknown")
}

pub fn build_host() -> &'static str {
    option_env!("BM2_BUILD_HOST").unwrap_or("unknown")
}

pub fn banner() -> String {
    format!(
        "bm2 {} (built {} on {})",
        env!("CARGO_PKG_VERSION"),
        build_time(),
        build_host()
    )
}
