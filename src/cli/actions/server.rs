use crate::api;
use crate::api::handlers::auth::AuthConfig;
use crate::cli::actions::Action;
use anyhow::Result;

/// Handle the server action
pub async fn handle(action: Action) -> Result<()> {
    match action {
        Action::Server {
            port,
            dsn,
            frontend_url,
            mfa_pepper,
            rp_id,
            rp_origin,
        } => {
            let mut auth_config = AuthConfig::new(&frontend_url, mfa_pepper)?;
            if let Some(rp_id) = rp_id {
                auth_config = auth_config.with_rp_id(&rp_id);
            }
            if let Some(rp_origin) = rp_origin {
                auth_config = auth_config.with_rp_origin(&rp_origin);
            }

            let email_config = api::email::OutboxWorkerConfig::new();

            api::new(port, dsn, auth_config, email_config).await?;
        }
    }

    Ok(())
}
