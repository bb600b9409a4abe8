fn main() {
    // option_env!() values are cached by cargo unless we ask for a rebuild.
    println!("cargo:rerun-if-env-changed=REALTIME_SYNC_DEFAULT_FEED_URL");
}
