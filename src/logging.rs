use env_logger::Env;

/// `TILTWIPE_LOG` takes the usual env_logger filter syntax; default `info`.
pub fn init() {
    let _ = env_logger::Builder::from_env(Env::default().filter_or("TILTWIPE_LOG", "info"))
        .format_timestamp_millis()
        .try_init();
}
