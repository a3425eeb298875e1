pub mod server;

use secrecy::SecretString;

#[derive(Debug)]
pub enum Action {
    Server {
        port: u16,
        dsn: String,
        frontend_url: String,
        mfa_pepper: SecretString,
        rp_id: Option<String>,
        rp_origin: Option<String>,
    },
}
