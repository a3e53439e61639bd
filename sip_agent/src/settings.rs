//! Compile-time configuration loaded via `toml-cfg` from `cfg.toml`
//! (section `[sip_agent]`).

#[toml_cfg::toml_config]
pub struct Settings {
    #[default("sip:pbx.example.com")]
    pub sip_registrar: &'static str,
    #[default("sip:1000@pbx.example.com")]
    pub sip_aor: &'static str,
    #[default("1000")]
    pub sip_username: &'static str,
    #[default("")]
    pub sip_password: &'static str,
    #[default("")]
    pub sip_proxy: &'static str,
    #[default(5060)]
    pub first_port: u16,
    #[default(5064)]
    pub last_port: u16,
    #[default(500)]
    pub receive_timeout_ms: u64,
    #[default(3600)]
    pub expires: u32,
    #[default("")]
    pub fallback_nonce: &'static str,
}
