fn main() {
    let env = env_logger::Env::default()
        .filter_or("SIP_LOG_LEVEL", "info")
        .write_style_or("SIP_LOG_STYLE", "auto");

    env_logger::init_from_env(env);

    if let Err(err) = sip_agent::run() {
        log::error!("sip-register: {err}");
        std::process::exit(1);
    }
}
