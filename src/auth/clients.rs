use oauth2::{
    AuthUrl, ClientId, ClientSecret, EndpointNotSet, EndpointSet, RedirectUrl, RevocationUrl, TokenUrl,
    basic::BasicClient,
};
use serde::Deserialize;

use crate::store::ProviderIdentity;

const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const REVOKE_URL: &str = "https://oauth2.googleapis.com/revoke";
pub(crate) const USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

pub(crate) const SCOPES: [&str; 2] = [
    "https://www.googleapis.com/auth/userinfo.email",
    "https://www.googleapis.com/auth/userinfo.profile",
];

pub(crate) type HappyClient = BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointSet, EndpointSet>;

#[derive(Debug, Clone)]
pub struct GoogleSettings {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
}

/// Configured Google OAuth client. Absent from the app state when the
/// credentials are not set, which disables Google sign-in.
#[derive(Clone)]
pub struct GoogleClient {
    client: HappyClient,
}

impl GoogleClient {
    pub fn new(settings: &GoogleSettings) -> anyhow::Result<GoogleClient> {
        let client = BasicClient::new(ClientId::new(settings.client_id.clone()))
            .set_client_secret(ClientSecret::new(settings.client_secret.clone()))
            .set_auth_uri(AuthUrl::new(AUTH_URL.to_owned())?)
            .set_token_uri(TokenUrl::new(TOKEN_URL.to_owned())?)
            .set_redirect_uri(RedirectUrl::new(settings.redirect_url.clone())?)
            .set_revocation_url(RevocationUrl::new(REVOKE_URL.to_owned())?);

        Ok(GoogleClient { client })
    }

    pub(crate) fn client(&self) -> &HappyClient {
        &self.client
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct GoogleUserInfo {
    pub id: String,
    pub email: Option<String>,
    #[serde(default)]
    pub verified_email: bool,
    pub name: Option<String>,
    pub picture: Option<String>,
}

impl GoogleUserInfo {
    pub(crate) fn into_identity(self) -> ProviderIdentity {
        ProviderIdentity {
            provider_id: self.id,
            // An unverified address must not be used to link accounts.
            email: self.email.filter(|_| self.verified_email),
            name: self.name,
            avatar_url: self.picture,
        }
    }
}
