use std::path::Path;

use chrono::Local;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::{
    error::BridgeError,
    store::{atomic_write_json, read_json, FileLock, SharedFiles},
};

/// Writes inbound WhatsApp messages into the Claude project history so they
/// show up as if the user had typed them.
#[derive(Clone, Debug)]
pub(crate) struct HistoryInjector {
    files: SharedFiles,
    project_key: String,
    history_limit: usize,
}

impl HistoryInjector {
    pub(crate) fn new(files: SharedFiles, project_key: String, history_limit: usize) -> Self {
        Self {
            files,
            project_key,
            history_limit,
        }
    }

    /// Read-modify-write of the Claude config under an exclusive lock. Nothing
    /// is written unless every step succeeds. Blocks; run it off the runtime.
    pub(crate) fn inject(
        &self,
        sender_id: &str,
        message: &str,
        message_id: &str,
    ) -> Result<(), BridgeError> {
        let config_path = &self.files.claude_config;
        let _lock = FileLock::acquire(&self.files.claude_config_lock_path())?;

        let mut document: Value = read_json(config_path)?.ok_or_else(|| {
            BridgeError::io(
                config_path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "claude config not found"),
            )
        })?;

        let display = render_prompt(
            sender_id,
            message,
            message_id,
            &Local::now().format("%d/%m/%Y, %H:%M:%S").to_string(),
            &self.files.reply,
        );
        let history_len = self.push_history_entry(&mut document, display)?;

        atomic_write_json(config_path, &document)?;

        info!(
            message_id,
            sender_id,
            project = %self.project_key,
            history_len,
            "message injected into claude history"
        );
        Ok(())
    }

    fn push_history_entry(
        &self,
        document: &mut Value,
        display: String,
    ) -> Result<usize, BridgeError> {
        let path = &self.files.claude_config;

        let root = document
            .as_object_mut()
            .ok_or_else(|| BridgeError::invalid_document(path, "root is not an object"))?;

        let projects = root
            .entry("projects")
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .ok_or_else(|| BridgeError::invalid_document(path, "projects is not an object"))?;

        let project = projects
            .entry(self.project_key.clone())
            .or_insert_with(|| {
                debug!(project = %self.project_key, "creating default project entry");
                default_project_entry()
            })
            .as_object_mut()
            .ok_or_else(|| BridgeError::invalid_document(path, "project entry is not an object"))?;

        let history = project
            .entry("history")
            .or_insert_with(|| Value::Array(Vec::new()))
            .as_array_mut()
            .ok_or_else(|| BridgeError::invalid_document(path, "history is not an array"))?;

        history.insert(
            0,
            json!({
                "display": display,
                "pastedContents": {}
            }),
        );
        history.truncate(self.history_limit);

        Ok(history.len())
    }
}

/// The project record Claude Code writes for a freshly opened directory.
pub(crate) fn default_project_entry() -> Value {
    json!({
        "allowedTools": [],
        "history": [],
        "mcpContextUris": [],
        "mcpServers": {},
        "enabledMcpjsonServers": [],
        "disabledMcpjsonServers": [],
        "hasTrustDialogAccepted": false,
        "projectOnboardingSeenCount": 1,
        "hasClaudeMdExternalIncludesApproved": false,
        "hasClaudeMdExternalIncludesWarningShown": false,
        "lastTotalWebSearchRequests": 0
    })
}

fn render_prompt(
    sender_id: &str,
    message: &str,
    message_id: &str,
    received_at: &str,
    reply_path: &Path,
) -> String {
    let reply_path = reply_path.display();
    format!(
        "🔔 MENSAGEM WHATSAPP RECEBIDA!

📱 **De:** {sender_id}
💬 **Mensagem:** \"{message}\"
🆔 **ID:** {message_id}
⏰ **Horário:** {received_at}

🎯 **AÇÃO NECESSÁRIA:**
Claude, por favor responda esta mensagem do WhatsApp usando Write tool para salvar em:
`{reply_path}`

Formato: `{{\"reply\": \"sua resposta aqui\"}}`
Opcional: inclua `\"messageId\": \"{message_id}\"` para vincular a resposta a esta mensagem.

Esta é uma mensagem REAL de um usuário do WhatsApp aguardando sua resposta!"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn files_in(dir: &Path) -> SharedFiles {
        SharedFiles {
            inbound: dir.join("whatsapp_messages.json"),
            reply: dir.join("claude_response.json"),
            claude_config: dir.join(".claude.json"),
        }
    }

    fn read_config(path: &Path) -> Value {
        serde_json::from_str(&fs::read_to_string(path).expect("read config")).expect("parse config")
    }

    fn history(config: &Value, key: &str) -> Vec<String> {
        config["projects"][key]["history"]
            .as_array()
            .expect("history array")
            .iter()
            .map(|entry| entry["display"].as_str().expect("display").to_string())
            .collect()
    }

    #[test]
    fn creates_default_project_entry_when_missing() {
        let dir = TempDir::new().expect("tempdir");
        let files = files_in(dir.path());
        fs::write(&files.claude_config, r#"{"numStartups": 7}"#).expect("seed");
        let injector = HistoryInjector::new(files.clone(), "/home/user".to_string(), 100);

        injector.inject("5511999999999", "oi", "1700000000000").expect("inject");

        let config = read_config(&files.claude_config);
        assert_eq!(config["numStartups"], 7);
        let project = &config["projects"]["/home/user"];
        assert_eq!(project["projectOnboardingSeenCount"], 1);
        assert_eq!(project["hasTrustDialogAccepted"], false);
        assert_eq!(project["allowedTools"], json!([]));
        assert_eq!(project["mcpServers"], json!({}));
        assert_eq!(project["lastTotalWebSearchRequests"], 0);

        let entries = history(&config, "/home/user");
        assert_eq!(entries.len(), 1);
        assert!(entries[0].contains("**De:** 5511999999999"));
        assert!(entries[0].contains("\"oi\""));
        assert!(entries[0].contains("1700000000000"));
        assert!(entries[0].contains(&files.reply.display().to_string()));
        assert_eq!(
            config["projects"]["/home/user"]["history"][0]["pastedContents"],
            json!({})
        );
    }

    #[test]
    fn does_not_reset_customized_project_fields() {
        let dir = TempDir::new().expect("tempdir");
        let files = files_in(dir.path());
        fs::write(&files.claude_config, "{}").expect("seed");
        let injector = HistoryInjector::new(files.clone(), "/home/user".to_string(), 100);
        injector.inject("a", "first", "1").expect("first inject");

        let mut config = read_config(&files.claude_config);
        config["projects"]["/home/user"]["hasTrustDialogAccepted"] = json!(true);
        config["projects"]["/home/user"]["allowedTools"] = json!(["Write"]);
        fs::write(&files.claude_config, config.to_string()).expect("customize");

        injector.inject("a", "second", "2").expect("second inject");

        let config = read_config(&files.claude_config);
        let project = &config["projects"]["/home/user"];
        assert_eq!(project["hasTrustDialogAccepted"], true);
        assert_eq!(project["allowedTools"], json!(["Write"]));
        assert_eq!(history(&config, "/home/user").len(), 2);
    }

    #[test]
    fn caps_history_keeping_most_recent_first() {
        let dir = TempDir::new().expect("tempdir");
        let files = files_in(dir.path());
        fs::write(&files.claude_config, "{}").expect("seed");
        let injector = HistoryInjector::new(files.clone(), "/home/user".to_string(), 100);

        for index in 0..105 {
            injector
                .inject("sender", &format!("msg-{index}"), &index.to_string())
                .expect("inject");
        }

        let entries = history(&read_config(&files.claude_config), "/home/user");
        assert_eq!(entries.len(), 100);
        assert!(entries[0].contains("\"msg-104\""));
        assert!(entries[99].contains("\"msg-5\""));
        assert!(!entries.iter().any(|entry| entry.contains("\"msg-4\"")));
    }

    #[test]
    fn preserves_sibling_projects() {
        let dir = TempDir::new().expect("tempdir");
        let files = files_in(dir.path());
        let seeded = json!({
            "projects": {
                "/work/other": {
                    "history": [{ "display": "keep me", "pastedContents": {} }],
                    "custom": 42
                }
            },
            "userID": "abc"
        });
        fs::write(&files.claude_config, seeded.to_string()).expect("seed");
        let injector = HistoryInjector::new(files.clone(), "/home/user".to_string(), 100);

        injector.inject("s", "m", "id").expect("inject");

        let config = read_config(&files.claude_config);
        assert_eq!(config["projects"]["/work/other"], seeded["projects"]["/work/other"]);
        assert_eq!(config["userID"], "abc");
    }

    #[test]
    fn adds_history_to_existing_project_without_one() {
        let dir = TempDir::new().expect("tempdir");
        let files = files_in(dir.path());
        fs::write(
            &files.claude_config,
            r#"{"projects": {"/home/user": {"allowedTools": ["Bash"]}}}"#,
        )
        .expect("seed");
        let injector = HistoryInjector::new(files.clone(), "/home/user".to_string(), 100);

        injector.inject("s", "m", "id").expect("inject");

        let config = read_config(&files.claude_config);
        assert_eq!(config["projects"]["/home/user"]["allowedTools"], json!(["Bash"]));
        assert_eq!(history(&config, "/home/user").len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn injects_through_symlinked_private_config() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().expect("tempdir");
        let files = files_in(dir.path());
        let real = dir.path().join("claude-real.json");
        fs::write(&real, "{}").expect("seed");
        fs::set_permissions(&real, fs::Permissions::from_mode(0o600)).expect("chmod");
        std::os::unix::fs::symlink(&real, &files.claude_config).expect("symlink");
        let injector = HistoryInjector::new(files.clone(), "/home/user".to_string(), 100);

        injector.inject("s", "m", "1").expect("inject");

        let link_meta = fs::symlink_metadata(&files.claude_config).expect("link metadata");
        assert!(link_meta.file_type().is_symlink());
        let mode = fs::metadata(&real).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(history(&read_config(&real), "/home/user").len(), 1);
    }

    #[test]
    fn fails_without_writing_when_config_is_missing() {
        let dir = TempDir::new().expect("tempdir");
        let files = files_in(dir.path());
        let injector = HistoryInjector::new(files.clone(), "/home/user".to_string(), 100);

        let error = injector.inject("s", "m", "id").expect_err("missing config");
        assert!(error.is_not_found());
        assert!(!files.claude_config.exists());
    }

    #[test]
    fn fails_without_writing_when_config_is_malformed() {
        let dir = TempDir::new().expect("tempdir");
        let files = files_in(dir.path());
        fs::write(&files.claude_config, "{ truncated").expect("seed");
        let injector = HistoryInjector::new(files.clone(), "/home/user".to_string(), 100);

        let error = injector.inject("s", "m", "id").expect_err("malformed config");
        assert!(matches!(error, BridgeError::Parse { .. }));
        assert_eq!(
            fs::read_to_string(&files.claude_config).expect("read"),
            "{ truncated"
        );
    }

    #[test]
    fn rejects_history_that_is_not_an_array() {
        let dir = TempDir::new().expect("tempdir");
        let files = files_in(dir.path());
        let seeded = r#"{"projects": {"/home/user": {"history": "oops"}}}"#;
        fs::write(&files.claude_config, seeded).expect("seed");
        let injector = HistoryInjector::new(files.clone(), "/home/user".to_string(), 100);

        let error = injector.inject("s", "m", "id").expect_err("bad history");
        assert!(matches!(error, BridgeError::InvalidDocument { .. }));
        assert_eq!(fs::read_to_string(&files.claude_config).expect("read"), seeded);
    }
}
