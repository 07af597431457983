//! Versioned app settings and the forward-only migration chain.
//!
//! Settings are stored as JSON with a `version` field, absent on the oldest documents.
//! Each migration step takes a document of version `n` and returns one of version `n + 1`,
//! filling in the defaults of the fields introduced by that version.  Documents with a
//! version newer than [`AppSettings::LATEST_VERSION`] are parsed as-is.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use snafu::ResultExt;
use tracing::debug;

use super::{InvalidShapeSnafu, JsonSnafu, NotAnObjectSnafu, SettingsError};

/// How the UI picks light or dark colors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    /// Follow the operating system.
    #[default]
    System,
    /// Always light.
    Light,
    /// Always dark.
    Dark,
}

/// How lightning invoices are paid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LightningPayMode {
    /// Ask every time.
    #[default]
    Prompt,
    /// Use a browser wallet.
    Webln,
    /// Open an external wallet.
    External,
}

/// User preferences, synchronized through relays.
///
/// The value is always fully migrated: [`AppSettings::version`] is either
/// [`AppSettings::LATEST_VERSION`] or, for documents written by a newer client, that
/// newer version.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSettings {
    pub version: u32,
    pub color_mode: ColorMode,
    pub theme: String,
    pub blur_images: bool,
    pub auto_show_media: bool,
    pub proxy_user_media: bool,
    pub show_reactions: bool,
    pub show_signature_verification: bool,
    pub image_proxy: String,
    pub cors_proxy: String,
    pub show_content_warning: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub twitter_redirect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reddit_redirect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub youtube_redirect: Option<String>,
    pub lightning_pay_mode: LightningPayMode,
    pub zap_amounts: Vec<u64>,
    pub muted_words: String,
    pub max_page_width: String,
    pub quick_reactions: Vec<String>,
    pub load_open_graph_data: bool,
    pub hide_usernames: bool,
    pub remove_emojis_in_usernames: bool,
}

impl AppSettings {
    /// The version produced by the last migration step.
    pub const LATEST_VERSION: u32 = 5;
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            version: Self::LATEST_VERSION,
            color_mode: ColorMode::System,
            theme: "default".to_string(),
            blur_images: true,
            auto_show_media: true,
            proxy_user_media: false,
            show_reactions: true,
            show_signature_verification: false,
            image_proxy: String::new(),
            cors_proxy: String::new(),
            show_content_warning: true,
            twitter_redirect: None,
            reddit_redirect: None,
            youtube_redirect: None,
            lightning_pay_mode: LightningPayMode::Prompt,
            zap_amounts: vec![50, 200, 500, 1000, 2000, 5000],
            muted_words: String::new(),
            max_page_width: "none".to_string(),
            quick_reactions: ["🤙", "❤️", "🤣", "😍", "🔥"].map(String::from).to_vec(),
            load_open_graph_data: true,
            hide_usernames: false,
            remove_emojis_in_usernames: false,
        }
    }
}

type Document = Map<String, Value>;

/// Migration steps, `STEPS[n]` upgrades version `n` to `n + 1`.
const STEPS: [fn(Document) -> Document; AppSettings::LATEST_VERSION as usize] =
    [to_v1, to_v2, to_v3, to_v4, to_v5];

fn object(value: Value) -> Document {
    match value {
        Value::Object(doc) => doc,
        _ => Document::new(),
    }
}

fn version_0_defaults() -> Value {
    json!({
        "colorMode": "system",
        "blurImages": true,
        "autoShowMedia": true,
        "proxyUserMedia": false,
        "showReactions": true,
        "showSignatureVerification": false,
        "imageProxy": "",
        "corsProxy": "",
        "showContentWarning": true,
        "lightningPayMode": "prompt",
        "zapAmounts": [50, 200, 500, 1000, 2000, 5000],
    })
}

fn with_defaults(mut doc: Document, version: u32, defaults: Value) -> Document {
    for (key, value) in object(defaults) {
        doc.entry(key).or_insert(value);
    }
    doc.insert("version".to_string(), json!(version));
    doc
}

fn to_v1(doc: Document) -> Document {
    with_defaults(doc, 1, json!({ "mutedWords": "" }))
}

fn to_v2(doc: Document) -> Document {
    with_defaults(doc, 2, json!({ "theme": "default" }))
}

fn to_v3(doc: Document) -> Document {
    with_defaults(
        doc,
        3,
        json!({
            "maxPageWidth": "none",
            "quickReactions": ["🤙", "❤️", "🤣", "😍", "🔥"],
        }),
    )
}

fn to_v4(doc: Document) -> Document {
    with_defaults(doc, 4, json!({ "loadOpenGraphData": true }))
}

fn to_v5(doc: Document) -> Document {
    with_defaults(
        doc,
        5,
        json!({ "hideUsernames": false, "removeEmojisInUsernames": false }),
    )
}

/// Migrates a settings document to the latest version.
///
/// A missing or unreadable `version` means version 0; fields missing from a version 0 document take
/// their version 0 defaults.  Already current documents are returned unchanged.
pub fn migrate(value: Value) -> Result<AppSettings, SettingsError> {
    let Value::Object(mut doc) = value else {
        return NotAnObjectSnafu.fail();
    };
    let version = match doc.get("version") {
        None | Some(Value::Null) => 0,
        Some(v) => match v.as_u64().and_then(|v| u32::try_from(v).ok()) {
            Some(version) => version,
            None => {
                debug!(version = %v, "unreadable settings version, migrating from version 0");
                0
            }
        },
    };
    if version == 0 {
        doc = with_defaults(doc, 0, version_0_defaults());
    }
    for step in STEPS.iter().skip(version as usize) {
        doc = step(doc);
    }
    serde_json::from_value(Value::Object(doc)).context(InvalidShapeSnafu)
}

/// Parses and migrates the JSON content of a settings record.
pub fn parse_app_settings(content: &str) -> Result<AppSettings, SettingsError> {
    let value: Value = serde_json::from_str(content).context(JsonSnafu)?;
    migrate(value)
}
