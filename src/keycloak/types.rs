//! Host event model: the records Keycloak hands to an event listener.
//!
//! These types are owned by the host. The bridge only ever borrows them for the
//! duration of a single publish call.

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::Error;

macro_rules! event_types {
    ($($variant:ident => $name:literal,)+) => {
        /// Type of a standard (authentication flow) event.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum EventType {
            $(
                #[serde(rename = $name)]
                $variant,
            )+
        }

        impl EventType {
            /// Every known event type, in declaration order.
            pub const ALL: &'static [EventType] = &[$(EventType::$variant,)+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(EventType::$variant => $name,)+
                }
            }
        }
    };
}

event_types! {
    Login => "LOGIN",
    LoginError => "LOGIN_ERROR",
    Register => "REGISTER",
    RegisterError => "REGISTER_ERROR",
    Logout => "LOGOUT",
    LogoutError => "LOGOUT_ERROR",
    CodeToToken => "CODE_TO_TOKEN",
    CodeToTokenError => "CODE_TO_TOKEN_ERROR",
    ClientLogin => "CLIENT_LOGIN",
    ClientLoginError => "CLIENT_LOGIN_ERROR",
    RefreshToken => "REFRESH_TOKEN",
    RefreshTokenError => "REFRESH_TOKEN_ERROR",
    IntrospectToken => "INTROSPECT_TOKEN",
    IntrospectTokenError => "INTROSPECT_TOKEN_ERROR",
    FederatedIdentityLink => "FEDERATED_IDENTITY_LINK",
    FederatedIdentityLinkError => "FEDERATED_IDENTITY_LINK_ERROR",
    RemoveFederatedIdentity => "REMOVE_FEDERATED_IDENTITY",
    RemoveFederatedIdentityError => "REMOVE_FEDERATED_IDENTITY_ERROR",
    UpdateEmail => "UPDATE_EMAIL",
    UpdateEmailError => "UPDATE_EMAIL_ERROR",
    UpdateProfile => "UPDATE_PROFILE",
    UpdateProfileError => "UPDATE_PROFILE_ERROR",
    UpdatePassword => "UPDATE_PASSWORD",
    UpdatePasswordError => "UPDATE_PASSWORD_ERROR",
    UpdateTotp => "UPDATE_TOTP",
    UpdateTotpError => "UPDATE_TOTP_ERROR",
    RemoveTotp => "REMOVE_TOTP",
    RemoveTotpError => "REMOVE_TOTP_ERROR",
    VerifyEmail => "VERIFY_EMAIL",
    VerifyEmailError => "VERIFY_EMAIL_ERROR",
    VerifyProfile => "VERIFY_PROFILE",
    VerifyProfileError => "VERIFY_PROFILE_ERROR",
    GrantConsent => "GRANT_CONSENT",
    GrantConsentError => "GRANT_CONSENT_ERROR",
    UpdateConsent => "UPDATE_CONSENT",
    UpdateConsentError => "UPDATE_CONSENT_ERROR",
    RevokeGrant => "REVOKE_GRANT",
    RevokeGrantError => "REVOKE_GRANT_ERROR",
    SendVerifyEmail => "SEND_VERIFY_EMAIL",
    SendVerifyEmailError => "SEND_VERIFY_EMAIL_ERROR",
    SendResetPassword => "SEND_RESET_PASSWORD",
    SendResetPasswordError => "SEND_RESET_PASSWORD_ERROR",
    SendIdentityProviderLink => "SEND_IDENTITY_PROVIDER_LINK",
    SendIdentityProviderLinkError => "SEND_IDENTITY_PROVIDER_LINK_ERROR",
    ResetPassword => "RESET_PASSWORD",
    ResetPasswordError => "RESET_PASSWORD_ERROR",
    RestartAuthentication => "RESTART_AUTHENTICATION",
    RestartAuthenticationError => "RESTART_AUTHENTICATION_ERROR",
    InvalidSignature => "INVALID_SIGNATURE",
    InvalidSignatureError => "INVALID_SIGNATURE_ERROR",
    UserInfoRequest => "USER_INFO_REQUEST",
    UserInfoRequestError => "USER_INFO_REQUEST_ERROR",
    IdentityProviderLinkAccount => "IDENTITY_PROVIDER_LINK_ACCOUNT",
    IdentityProviderLinkAccountError => "IDENTITY_PROVIDER_LINK_ACCOUNT_ERROR",
    IdentityProviderLogin => "IDENTITY_PROVIDER_LOGIN",
    IdentityProviderLoginError => "IDENTITY_PROVIDER_LOGIN_ERROR",
    IdentityProviderFirstLogin => "IDENTITY_PROVIDER_FIRST_LOGIN",
    IdentityProviderFirstLoginError => "IDENTITY_PROVIDER_FIRST_LOGIN_ERROR",
    IdentityProviderPostLogin => "IDENTITY_PROVIDER_POST_LOGIN",
    IdentityProviderPostLoginError => "IDENTITY_PROVIDER_POST_LOGIN_ERROR",
    Impersonate => "IMPERSONATE",
    ImpersonateError => "IMPERSONATE_ERROR",
    CustomRequiredAction => "CUSTOM_REQUIRED_ACTION",
    CustomRequiredActionError => "CUSTOM_REQUIRED_ACTION_ERROR",
    ExecuteActions => "EXECUTE_ACTIONS",
    ExecuteActionsError => "EXECUTE_ACTIONS_ERROR",
    ExecuteActionToken => "EXECUTE_ACTION_TOKEN",
    ExecuteActionTokenError => "EXECUTE_ACTION_TOKEN_ERROR",
    ClientInfo => "CLIENT_INFO",
    ClientInfoError => "CLIENT_INFO_ERROR",
    ClientRegister => "CLIENT_REGISTER",
    ClientRegisterError => "CLIENT_REGISTER_ERROR",
    ClientUpdate => "CLIENT_UPDATE",
    ClientUpdateError => "CLIENT_UPDATE_ERROR",
    ClientDelete => "CLIENT_DELETE",
    ClientDeleteError => "CLIENT_DELETE_ERROR",
    TokenExchange => "TOKEN_EXCHANGE",
    TokenExchangeError => "TOKEN_EXCHANGE_ERROR",
    PermissionToken => "PERMISSION_TOKEN",
    PermissionTokenError => "PERMISSION_TOKEN_ERROR",
    DeleteAccount => "DELETE_ACCOUNT",
    DeleteAccountError => "DELETE_ACCOUNT_ERROR",
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        EventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| Error::Config(format!("Unknown event type '{}'", s)))
    }
}

/// Kind of mutation an admin event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    Create,
    Update,
    Delete,
    Action,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "CREATE",
            OperationType::Update => "UPDATE",
            OperationType::Delete => "DELETE",
            OperationType::Action => "ACTION",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A standard event emitted during an authentication flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default)]
    pub id: Option<String>,
    /// Epoch milliseconds.
    pub time: i64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub realm_id: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
}

impl Event {
    pub fn new(event_type: EventType, realm_id: impl Into<String>) -> Self {
        Self {
            id: None,
            time: Utc::now().timestamp_millis(),
            event_type,
            realm_id: realm_id.into(),
            client_id: None,
            user_id: None,
            session_id: None,
            ip_address: None,
            error: None,
            details: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_time(mut self, time: i64) -> Self {
        self.time = time;
        self
    }

    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_ip(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// Who performed an admin operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthDetails {
    pub realm_id: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
}

impl AuthDetails {
    pub fn new(realm_id: impl Into<String>) -> Self {
        Self {
            realm_id: realm_id.into(),
            client_id: None,
            user_id: None,
            ip_address: None,
        }
    }
}

/// A resource mutation performed through the admin API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminEvent {
    #[serde(default)]
    pub id: Option<String>,
    /// Epoch milliseconds.
    pub time: i64,
    pub realm_id: String,
    pub auth_details: AuthDetails,
    pub operation_type: OperationType,
    /// Host-defined resource kind such as `USER`, `REALM` or `CLIENT`.
    pub resource_type: String,
    pub resource_path: String,
    /// JSON text of the resource, when the host captured it.
    #[serde(default, deserialize_with = "representation_text")]
    pub representation: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl AdminEvent {
    pub fn new(
        operation_type: OperationType,
        resource_type: impl Into<String>,
        resource_path: impl Into<String>,
        auth_details: AuthDetails,
    ) -> Self {
        Self {
            id: None,
            time: Utc::now().timestamp_millis(),
            realm_id: auth_details.realm_id.clone(),
            auth_details,
            operation_type,
            resource_type: resource_type.into(),
            resource_path: resource_path.into(),
            representation: None,
            error: None,
        }
    }

    pub fn with_realm(mut self, realm_id: impl Into<String>) -> Self {
        self.realm_id = realm_id.into();
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_time(mut self, time: i64) -> Self {
        self.time = time;
        self
    }

    pub fn with_representation(mut self, representation: impl Into<String>) -> Self {
        self.representation = Some(representation.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Accepts the representation either as JSON text or as the embedded JSON
/// value the serializer publishes.
fn representation_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text),
        Some(value) => Some(value.to_string()),
    })
}

/// Borrowed view of whatever the host just delivered.
#[derive(Debug, Clone, Copy)]
pub enum HostEvent<'a> {
    Standard(&'a Event),
    Admin {
        event: &'a AdminEvent,
        include_representation: bool,
    },
}

impl<'a> HostEvent<'a> {
    pub fn realm_id(&self) -> &'a str {
        match self {
            HostEvent::Standard(event) => &event.realm_id,
            HostEvent::Admin { event, .. } => &event.realm_id,
        }
    }

    /// Short label for log lines: the event type or the admin operation.
    pub fn label(&self) -> &'static str {
        match self {
            HostEvent::Standard(event) => event.event_type.as_str(),
            HostEvent::Admin { event, .. } => event.operation_type.as_str(),
        }
    }
}
