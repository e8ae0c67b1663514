//! Default configuration documents written when the user provides none.

use serde_json::{json, Value as Json};
use synop_apply::DocumentError;
use synop_core::naming::compute_fqdn;
use uuid::Uuid;

pub const SYNAPSE_PORT: i32 = 8008;
pub const MAUTRIX_SIGNAL_PORT: i32 = 29328;
pub const HEISENBRIDGE_PORT: i32 = 9898;

pub const SIGNALD_SOCKET: &str = "/signald/signald.sock";
pub const MAUTRIX_SIGNAL_LOG: &str = "/data/mautrix-signal.log";

fn to_yaml(doc: &Json) -> Result<String, DocumentError> {
    serde_yaml::to_string(doc).map_err(DocumentError::Serialize)
}

/// `http://<fqdn>:<port>` of a Service.
pub fn service_url(name: &str, namespace: &str, port: i32) -> String {
    format!("http://{}:{}", compute_fqdn(name, namespace), port)
}

/// Minimal `homeserver.yaml`: one plain HTTP listener and a SQLite database
/// under `/data`, until a PostgreSQL section replaces it.
pub fn homeserver_yaml(server_name: &str, report_stats: bool) -> Result<String, DocumentError> {
    to_yaml(&json!({
        "server_name": server_name,
        "report_stats": report_stats,
        "pid_file": "/homeserver.pid",
        "listeners": [{
            "port": SYNAPSE_PORT,
            "tls": false,
            "type": "http",
            "x_forwarded": true,
            "resources": [{ "names": ["client", "federation"], "compress": false }],
        }],
        "database": { "name": "sqlite3", "args": { "database": "/data/homeserver.db" } },
        "log_config": format!("/data/{}.log.config", server_name),
        "media_store_path": "/data/media_store",
        "signing_key_path": format!("/data/{}.signing.key", server_name),
        "trusted_key_servers": [{ "server_name": "matrix.org" }],
    }))
}

/// `bridge.permissions`: relay for everyone, user for the homeserver's
/// domain, admin for its `@admin` account.
pub fn mautrix_permissions(server_name: &str) -> Json {
    json!({
        "*": "relay",
        server_name: "user",
        format!("@admin:{}", server_name): "admin",
    })
}

pub struct MautrixSignalTemplate<'a> {
    pub synapse_url: String,
    pub bridge_url: String,
    pub server_name: &'a str,
}

/// Default mautrix-signal `config.yaml`.
pub fn mautrix_signal_config(t: &MautrixSignalTemplate<'_>) -> Result<String, DocumentError> {
    to_yaml(&json!({
        "homeserver": {
            "address": t.synapse_url,
            "domain": t.server_name,
            "verify_ssl": true,
            "asmux": false,
            "http_retry_count": 4,
            "connection_limit": 100,
            "async_media": false,
        },
        "appservice": {
            "address": t.bridge_url,
            "hostname": "0.0.0.0",
            "port": MAUTRIX_SIGNAL_PORT,
            "max_body_size": 1,
            "database": "sqlite:////data/sqlite.db",
            "database_opts": { "min_size": 5, "max_size": 10 },
            "id": "signal",
            "bot_username": "signalbot",
            "bot_displayname": "Signal bridge bot",
            "ephemeral_events": false,
            "as_token": "This value is generated when generating the registration",
            "hs_token": "This value is generated when generating the registration",
        },
        "metrics": { "enabled": false, "listen_port": 8000 },
        "signal": {
            "socket_path": SIGNALD_SOCKET,
            "outgoing_attachment_dir": "/tmp",
            "avatar_dir": "~/.config/signald/avatars",
            "data_dir": "~/.config/signald/data",
            "delete_unknown_accounts_on_start": false,
            "remove_file_after_handling": true,
            "registration_enabled": true,
        },
        "bridge": {
            "username_template": "signal_{userid}",
            "displayname_template": "{displayname} (Signal)",
            "federate_rooms": true,
            "encryption": { "allow": false, "default": false },
            "command_prefix": "!signal",
            "permissions": mautrix_permissions(t.server_name),
            "relay": { "enabled": false },
        },
        "logging": {
            "version": 1,
            "formatters": { "normal": { "format": "[%(asctime)s] [%(levelname)s@%(name)s] %(message)s" } },
            "handlers": {
                "file": {
                    "class": "logging.handlers.RotatingFileHandler",
                    "formatter": "normal",
                    "filename": MAUTRIX_SIGNAL_LOG,
                    "maxBytes": 10485760,
                    "backupCount": 10,
                },
                "console": { "class": "logging.StreamHandler", "formatter": "normal" },
            },
            "root": { "level": "DEBUG", "handlers": ["file", "console"] },
        },
    }))
}

/// Secrets shared by an app service and its homeserver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppServiceTokens {
    pub as_token: String,
    pub hs_token: String,
}

impl AppServiceTokens {
    /// Fresh random tokens, 64 hex characters each.
    pub fn generate() -> Self {
        let token = || format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        Self { as_token: token(), hs_token: token() }
    }
}

/// Default Heisenbridge app service registration.
pub fn heisenbridge_registration(bridge_url: &str, tokens: &AppServiceTokens) -> Result<String, DocumentError> {
    to_yaml(&json!({
        "id": "heisenbridge",
        "url": bridge_url,
        "as_token": tokens.as_token,
        "hs_token": tokens.hs_token,
        "rate_limited": false,
        "sender_localpart": "heisenbridge",
        "namespaces": {
            "users": [{ "regex": "@irc_.*", "exclusive": true }],
            "aliases": [],
            "rooms": [],
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use synop_apply::parse_yaml;

    #[test]
    fn homeserver_template_carries_values() {
        let doc = parse_yaml("homeserver.yaml", &homeserver_yaml("example.com", true).unwrap()).unwrap();
        assert_eq!(doc["server_name"].as_str(), Some("example.com"));
        assert_eq!(doc["report_stats"].as_bool(), Some(true));
        assert_eq!(doc["database"]["name"].as_str(), Some("sqlite3"));
    }

    #[test]
    fn mautrix_template_points_both_ways() {
        let t = MautrixSignalTemplate {
            synapse_url: service_url("hs", "matrix", SYNAPSE_PORT),
            bridge_url: service_url("ms", "bridges", MAUTRIX_SIGNAL_PORT),
            server_name: "example.com",
        };
        let doc = parse_yaml("config.yaml", &mautrix_signal_config(&t).unwrap()).unwrap();
        assert_eq!(doc["homeserver"]["address"].as_str(), Some("http://hs.matrix.svc.cluster.local:8008"));
        assert_eq!(doc["appservice"]["address"].as_str(), Some("http://ms.bridges.svc.cluster.local:29328"));
        assert_eq!(doc["bridge"]["permissions"]["@admin:example.com"].as_str(), Some("admin"));
    }

    #[test]
    fn generated_tokens_are_distinct() {
        let (a, b) = (AppServiceTokens::generate(), AppServiceTokens::generate());
        assert_eq!(a.as_token.len(), 64);
        assert!(a.as_token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a.as_token, a.hs_token);
        assert_ne!(a, b);

        let doc = parse_yaml("heisenbridge.yaml", &heisenbridge_registration("http://hb:9898", &a).unwrap()).unwrap();
        assert_eq!(doc["as_token"].as_str(), Some(a.as_token.as_str()));
        assert_eq!(doc["url"].as_str(), Some("http://hb:9898"));
    }
}
