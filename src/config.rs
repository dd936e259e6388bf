//! Configuration structures for PDF signing.
//!
//! Loaded once at startup from TOML, then shared immutably (`Arc`) with the
//! orchestrator. Secrets may be supplied through environment variables,
//! which take precedence over the file.

use crate::error::{Result, SignError};
use crate::intent::{
    CertificationLevel, DEFAULT_OUTPUT_SUFFIX, DEFAULT_SIGNATURE_NAME, KeystoreSource,
    PermissionFlags, Placement, SigningIntent, VisibleSignature, signature_text,
};
use crate::invocation::ToolLocation;
use crate::secret::{REDACTED, Secret, non_empty};
use crate::session::BusyPolicy;
use crate::warn;
use chrono::{DateTime, FixedOffset};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file location relative to the platform config directory
pub const DEFAULT_CONFIG_FILE: &str = "kodegen/pdf-sign.toml";

pub const DEFAULT_JSIGNPDF_JAR: &str = r"C:\tools\JSignPdf\JSignPdf.jar";

/// Java installs probed, in order, when `tool.java` is unset
pub const JAVA_CANDIDATES: &[&str] = &[
    r"C:\tools\temurin-jre\jdk-17.0.17+10-jre\bin\java.exe",
    r"C:\Program Files\Java\jre-17\bin\java.exe",
    r"C:\Program Files\Java\jre1.8.0_371\bin\java.exe",
    "/usr/lib/jvm/default-java/bin/java",
];

pub const PIN_ENV: &str = "KODEGEN_PDF_PIN";
pub const OWNER_PASSWORD_ENV: &str = "KODEGEN_PDF_OWNER_PASSWORD";
pub const USER_PASSWORD_ENV: &str = "KODEGEN_PDF_USER_PASSWORD";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SignerConfig {
    /// JSON-lines audit trail. Disabled when unset.
    pub audit_log: Option<PathBuf>,
    pub tool: ToolConfig,
    pub keystore: KeystoreConfig,
    pub signing: SigningConfig,
    pub permissions: PermissionFlags,
    pub visible_signature: Option<VisibleSignatureConfig>,
    pub watch: WatchConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolConfig {
    /// Java executable. Discovered when unset.
    pub java: Option<PathBuf>,
    pub jsignpdf_jar: PathBuf,
    /// Kill the tool after this many seconds. No limit when unset or 0.
    pub timeout_secs: Option<u64>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            java: None,
            jsignpdf_jar: PathBuf::from(DEFAULT_JSIGNPDF_JAR),
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum KeystoreKind {
    #[default]
    #[serde(rename = "windows-my")]
    WindowsMy,
    #[serde(rename = "pkcs11")]
    Pkcs11,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeystoreConfig {
    #[serde(rename = "type")]
    pub kind: KeystoreKind,
    /// PKCS#11 provider config file
    pub config_path: Option<PathBuf>,
    pub pin: Option<Secret>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SigningConfig {
    pub certificate_alias: Option<String>,
    pub owner_password: Option<Secret>,
    pub user_password: Option<Secret>,
    pub certification_level: Option<CertificationLevel>,
    pub timestamp_url: Option<String>,
    pub output_suffix: String,
    pub output_directory: Option<PathBuf>,
    /// Replace an existing signed output instead of refusing the session.
    pub overwrite: bool,
    pub signature_name: Option<String>,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            certificate_alias: None,
            owner_password: None,
            user_password: None,
            certification_level: None,
            timestamp_url: None,
            output_suffix: DEFAULT_OUTPUT_SUFFIX.to_string(),
            output_directory: None,
            overwrite: false,
            signature_name: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VisibleSignatureConfig {
    pub page: u32,
    pub placement: Placement,
    pub image: Option<PathBuf>,
}

impl Default for VisibleSignatureConfig {
    fn default() -> Self {
        Self {
            page: 1,
            placement: Placement::default(),
            image: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchConfig {
    pub busy_policy: BusyPolicy,
}

/// Default config file path (`~/.config/kodegen/pdf-sign.toml` on Linux).
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(DEFAULT_CONFIG_FILE))
}

/// Expand tilde in path, returning error if HOME is not set
pub fn expand_tilde_path(path: &str) -> Result<String> {
    let expanded = shellexpand::tilde(path).to_string();

    // shellexpand leaves ~ unchanged when HOME is unset
    if path.starts_with('~') && expanded.starts_with('~') {
        return Err(SignError::config(
            "Could not expand ~ in path (HOME environment variable not set).\n\
             Please use an absolute path instead.",
        ));
    }

    Ok(expanded)
}

fn expand(path: &Path) -> Result<PathBuf> {
    match path.to_str() {
        Some(s) => expand_tilde_path(s).map(PathBuf::from),
        None => Ok(path.to_path_buf()),
    }
}

fn expand_opt(path: &mut Option<PathBuf>) -> Result<()> {
    if let Some(p) = path.as_mut() {
        *p = expand(p)?;
    }
    Ok(())
}

impl SignerConfig {
    /// Load from `explicit`, else the default location if it exists, else defaults.
    pub async fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(p) => Some(expand(p)?),
            None => default_config_path().filter(|p| p.is_file()),
        };

        let config = match path {
            Some(path) => {
                let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
                    SignError::config(format!("Cannot read config {}: {e}", path.display()))
                })?;
                Self::from_toml_str(&content)?
            }
            None => Self::default(),
        };

        Ok(config.with_env_overrides(|key| std::env::var(key).ok()))
    }

    /// Parse TOML and expand `~` in every path.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content)?;
        expand_opt(&mut config.audit_log)?;
        expand_opt(&mut config.tool.java)?;
        config.tool.jsignpdf_jar = expand(&config.tool.jsignpdf_jar)?;
        expand_opt(&mut config.keystore.config_path)?;
        expand_opt(&mut config.signing.output_directory)?;
        if let Some(visible) = config.visible_signature.as_mut() {
            expand_opt(&mut visible.image)?;
        }
        Ok(config)
    }

    /// Replace secrets with non-empty values from `lookup` (the process environment in production).
    #[must_use]
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty()).map(Secret::new);
        if let Some(pin) = get(PIN_ENV) {
            self.keystore.pin = Some(pin);
        }
        if let Some(owner) = get(OWNER_PASSWORD_ENV) {
            self.signing.owner_password = Some(owner);
        }
        if let Some(user) = get(USER_PASSWORD_ENV) {
            self.signing.user_password = Some(user);
        }
        self
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.tool
            .timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    #[must_use]
    pub fn keystore_source(&self) -> KeystoreSource {
        match self.keystore.kind {
            KeystoreKind::WindowsMy => KeystoreSource::WindowsStore,
            KeystoreKind::Pkcs11 => KeystoreSource::Pkcs11 {
                config_path: self.keystore.config_path.clone().unwrap_or_default(),
                pin: self.keystore.pin.clone(),
            },
        }
    }

    /// Locate java and the JSignPdf jar.
    pub fn tool_location(&self) -> Result<ToolLocation> {
        let java = find_java(self.tool.java.as_deref())?;
        let jar = &self.tool.jsignpdf_jar;
        if !jar.is_file() {
            return Err(SignError::MissingDependency(format!(
                "JSignPdf.jar not found at {}.\n\
                 \n\
                 Download JSignPdf from https://github.com/intoolswetrust/jsignpdf/releases\n\
                 and set [tool] jsignpdf_jar in the config file.",
                jar.display()
            )));
        }
        Ok(ToolLocation::jsignpdf(java, jar))
    }

    /// Merge a picked file with the configured defaults.
    ///
    /// `now` stamps the visible signature text, so the resulting intent is
    /// fully determined at creation.
    pub fn intent_for(&self, input_path: PathBuf, now: DateTime<FixedOffset>) -> SigningIntent {
        let signing = &self.signing;
        let alias = signing
            .certificate_alias
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string);

        let signature_name = signing
            .signature_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .or_else(|| alias.clone())
            .unwrap_or_else(|| DEFAULT_SIGNATURE_NAME.to_string());

        let visible_signature = self.visible_signature.as_ref().map(|visible| {
            let image = match &visible.image {
                Some(image) if image.is_file() => Some(image.clone()),
                Some(image) => {
                    warn!(
                        "Signature image not found ({}); continuing without background image.",
                        image.display()
                    );
                    None
                }
                None => None,
            };
            VisibleSignature {
                page: visible.page,
                placement: visible.placement,
                image,
                text: signature_text(&signature_name, now),
            }
        });

        SigningIntent {
            input_path,
            keystore: self.keystore_source(),
            certificate_alias: alias,
            owner_password: signing.owner_password.clone(),
            user_password: signing.user_password.clone(),
            permissions: self.permissions,
            certification_level: signing.certification_level,
            timestamp_authority_url: signing.timestamp_url.clone(),
            output_suffix: signing.output_suffix.clone(),
            output_directory: signing.output_directory.clone(),
            signature_name,
            visible_signature,
        }
    }

    /// Human-readable settings for `show`, secrets masked.
    #[must_use]
    pub fn describe(&self) -> Vec<(&'static str, String)> {
        fn secret_state(secret: Option<&Secret>) -> String {
            if non_empty(secret).is_some() {
                REDACTED.to_string()
            } else {
                "(not set)".to_string()
            }
        }
        fn path_or(path: Option<&Path>, fallback: &str) -> String {
            path.map(|p| p.display().to_string())
                .unwrap_or_else(|| fallback.to_string())
        }

        let keystore = self.keystore_source();
        let perms = &self.permissions;
        let active: Vec<&str> = [
            (perms.disable_copy, "disable_copy"),
            (perms.disable_printing, "disable_printing"),
            (perms.degraded_printing, "degraded_printing"),
            (perms.disable_modify_content, "disable_modify_content"),
            (perms.disable_modify_annotations, "disable_modify_annotations"),
            (perms.disable_fill, "disable_fill"),
            (perms.disable_screen_readers, "disable_screen_readers"),
            (perms.disable_assembly, "disable_assembly"),
        ]
        .into_iter()
        .filter_map(|(on, name)| on.then_some(name))
        .collect();

        let mut rows = vec![
            ("Java", path_or(self.tool.java.as_deref(), "(auto-detect)")),
            ("JSignPdf jar", self.tool.jsignpdf_jar.display().to_string()),
            (
                "Timeout",
                self.timeout()
                    .map(|t| format!("{}s", t.as_secs()))
                    .unwrap_or_else(|| "none".to_string()),
            ),
            ("Keystore", keystore.display_name().to_string()),
        ];
        if let KeystoreSource::Pkcs11 { config_path, pin } = &keystore {
            rows.push(("PKCS#11 config", config_path.display().to_string()));
            rows.push(("PKCS#11 PIN", secret_state(pin.as_ref())));
        }
        rows.extend([
            (
                "Certificate alias",
                self.signing
                    .certificate_alias
                    .clone()
                    .unwrap_or_else(|| "(default)".to_string()),
            ),
            (
                "Certification",
                self.signing
                    .certification_level
                    .map(|l| l.display_name().to_string())
                    .unwrap_or_else(|| "not certified".to_string()),
            ),
            ("Owner password", secret_state(self.signing.owner_password.as_ref())),
            ("User password", secret_state(self.signing.user_password.as_ref())),
            (
                "Permissions",
                if active.is_empty() {
                    "(no restrictions)".to_string()
                } else {
                    active.join(", ")
                },
            ),
            (
                "Timestamp URL",
                self.signing
                    .timestamp_url
                    .clone()
                    .unwrap_or_else(|| "(none)".to_string()),
            ),
            ("Output suffix", self.signing.output_suffix.clone()),
            (
                "Output directory",
                path_or(self.signing.output_directory.as_deref(), "(next to input)"),
            ),
            ("Overwrite", self.signing.overwrite.to_string()),
            (
                "Visible signature",
                self.visible_signature
                    .as_ref()
                    .map(|v| format!("page {}, {:?}", v.page, v.placement))
                    .unwrap_or_else(|| "off".to_string()),
            ),
            ("Busy policy", format!("{:?}", self.watch.busy_policy)),
            ("Audit log", path_or(self.audit_log.as_deref(), "(disabled)")),
        ]);
        rows
    }
}

/// Find a java executable: configured path, well-known installs, then `PATH`.
pub fn find_java(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(java) = configured {
        if java.is_file() {
            return Ok(java.to_path_buf());
        }
        return which::which(java).map_err(|_| {
            SignError::MissingDependency(format!(
                "Java executable not found: {}. Adjust [tool] java in the config file.",
                java.display()
            ))
        });
    }

    if let Some(candidate) = JAVA_CANDIDATES.iter().map(Path::new).find(|p| p.is_file()) {
        return Ok(candidate.to_path_buf());
    }

    which::which("java").map_err(|_| {
        SignError::MissingDependency(
            "Java not found.\n\
             \n\
             JSignPdf needs a Java runtime (17 or newer recommended).\n\
             Install one (e.g. Temurin JRE) or set [tool] java in the config file."
                .to_string(),
        )
    })
}
