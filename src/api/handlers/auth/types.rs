//! Request and response bodies for the auth endpoints.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use webauthn_rs::prelude::{
    CreationChallengeResponse, PublicKeyCredential, RegisterPublicKeyCredential,
    RequestChallengeResponse,
};

#[derive(Deserialize, ToSchema)]
pub struct LoginRequest {
    pub email: String,
    #[schema(value_type = String)]
    pub password: SecretString,
}

/// Login never returns a full session directly: the caller either still
/// has to register a passkey (`setup_required`) or prove one
/// (`passkey_required`).
#[derive(Serialize, ToSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoginResponse {
    SetupRequired {
        setup_token: String,
    },
    PasskeyRequired {
        login_id: Uuid,
        #[schema(value_type = Object)]
        challenge: RequestChallengeResponse,
    },
}

#[derive(Deserialize, ToSchema)]
pub struct VerifyPasskeyRequest {
    pub login_id: Uuid,
    #[schema(value_type = Object)]
    pub credential: PublicKeyCredential,
}

#[derive(Deserialize, ToSchema)]
pub struct VerifyBackupCodeRequest {
    pub login_id: Uuid,
    #[schema(value_type = String)]
    pub code: SecretString,
}

#[derive(Serialize, ToSchema)]
pub struct SessionResponse {
    pub token: String,
}

#[derive(Serialize, ToSchema)]
pub struct SetupChallengeResponse {
    pub registration_id: Uuid,
    #[schema(value_type = Object)]
    pub challenge: CreationChallengeResponse,
}

#[derive(Deserialize, ToSchema)]
pub struct SetupConfirmRequest {
    pub registration_id: Uuid,
    #[schema(value_type = Object)]
    pub credential: RegisterPublicKeyCredential,
    pub label: Option<String>,
}

/// Backup codes appear in a response exactly once, at generation time.
#[derive(Serialize, ToSchema)]
pub struct SetupConfirmResponse {
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_codes: Option<Vec<String>>,
}

#[derive(Serialize, ToSchema)]
pub struct BackupCodesResponse {
    pub backup_codes: Vec<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct PasswordResetRequest {
    pub email: String,
}

#[derive(Deserialize, ToSchema)]
pub struct PasswordResetConfirmRequest {
    pub token: String,
    #[schema(value_type = String)]
    pub new_password: SecretString,
}

#[derive(Deserialize, ToSchema)]
pub struct InvitationAcceptRequest {
    pub token: String,
    #[schema(value_type = String)]
    pub password: SecretString,
}

#[derive(Serialize, ToSchema)]
pub struct MeResponse {
    pub id: Uuid,
    pub email: String,
    pub role: String,
    pub homes: Vec<HomeSummary>,
}

#[derive(Serialize, ToSchema)]
pub struct HomeSummary {
    pub id: Uuid,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_response_tags_by_status() {
        let response = LoginResponse::SetupRequired {
            setup_token: "abc".to_string(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "setup_required");
        assert_eq!(json["setup_token"], "abc");
    }

    #[test]
    fn setup_confirm_response_omits_absent_backup_codes() {
        let response = SetupConfirmResponse {
            token: "t".to_string(),
            backup_codes: None,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("backup_codes").is_none());
    }
}
