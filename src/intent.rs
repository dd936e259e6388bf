//! The declarative signing request and its validation rules.

use crate::error::{Result, SignError};
use crate::secret::{Secret, non_empty};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_OUTPUT_SUFFIX: &str = "_signed";

/// Signer name used when neither a signature name nor an alias is configured.
pub const DEFAULT_SIGNATURE_NAME: &str = "Certified signer";

// Visible signature box geometry, in PDF points.
const SIG_WIDTH: i32 = 240;
const SIG_HEIGHT: i32 = 90;
const SIG_MARGIN_X: i32 = 36;
const SIG_MARGIN_Y: i32 = 36;

/// Where the signing key lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeystoreSource {
    /// Current user's Windows certificate store (`WINDOWS-MY`).
    WindowsStore,
    /// PKCS#11 hardware token described by a provider config file.
    Pkcs11 {
        config_path: PathBuf,
        pin: Option<Secret>,
    },
}

impl KeystoreSource {
    #[must_use]
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::WindowsStore => "Windows certificate store",
            Self::Pkcs11 { .. } => "PKCS#11 token",
        }
    }
}

/// Certification mode of the signature. Absent means a plain approval signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CertificationLevel {
    NoChangesAllowed,
    FormFilling,
    FormFillingAndAnnotations,
}

impl CertificationLevel {
    /// Value understood by the signing tool's `-cl` option.
    #[must_use]
    pub fn as_tool_str(&self) -> &'static str {
        match self {
            Self::NoChangesAllowed => "CERTIFIED_NO_CHANGES_ALLOWED",
            Self::FormFilling => "CERTIFIED_FORM_FILLING",
            Self::FormFillingAndAnnotations => "CERTIFIED_FORM_FILLING_AND_ANNOTATIONS",
        }
    }

    #[must_use]
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::NoChangesAllowed => "Certified, no changes allowed",
            Self::FormFilling => "Certified, form filling allowed",
            Self::FormFillingAndAnnotations => "Certified, form filling and annotations allowed",
        }
    }
}

/// Independent permission restrictions applied to the output PDF.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PermissionFlags {
    pub disable_copy: bool,
    pub disable_printing: bool,
    /// Allow only low-resolution printing. Conflicts with `disable_printing`.
    pub degraded_printing: bool,
    pub disable_modify_content: bool,
    pub disable_modify_annotations: bool,
    pub disable_fill: bool,
    pub disable_screen_readers: bool,
    pub disable_assembly: bool,
}

impl PermissionFlags {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Placement {
    BottomLeft,
    #[default]
    BottomRight,
}

/// Signature rectangle. Negative x values are measured from the right page edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureRect {
    pub llx: i32,
    pub lly: i32,
    pub urx: i32,
    pub ury: i32,
}

impl Placement {
    #[must_use]
    pub fn rect(self) -> SignatureRect {
        match self {
            Self::BottomLeft => SignatureRect {
                llx: SIG_MARGIN_X,
                lly: SIG_MARGIN_Y,
                urx: SIG_MARGIN_X + SIG_WIDTH,
                ury: SIG_MARGIN_Y + SIG_HEIGHT,
            },
            Self::BottomRight => SignatureRect {
                llx: -(SIG_MARGIN_X + SIG_WIDTH),
                lly: SIG_MARGIN_Y,
                urx: -SIG_MARGIN_X,
                ury: SIG_MARGIN_Y + SIG_HEIGHT,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisibleSignature {
    /// 1-based page number.
    pub page: u32,
    pub placement: Placement,
    /// Background PNG. Only set when the file was found at intent creation.
    pub image: Option<PathBuf>,
    /// Layer-2 description text, fixed when the intent is created.
    pub text: String,
}

/// Build the visible description text, e.g.
///
/// ```text
/// Digitally signed
/// by Jane Doe
/// Date: 2026.10.19
/// 14:03:11 +02'00'
/// ```
#[must_use]
pub fn signature_text(signer: &str, at: DateTime<FixedOffset>) -> String {
    let signer = if signer.trim().is_empty() {
        DEFAULT_SIGNATURE_NAME
    } else {
        signer.trim()
    };

    let tz_raw = at.format("%z").to_string();
    let tz = if tz_raw.len() == 5 {
        format!("{}'{}'", &tz_raw[..3], &tz_raw[3..])
    } else {
        tz_raw
    };

    format!(
        "Digitally signed\nby {signer}\nDate: {}\n{} {tz}",
        at.format("%Y.%m.%d"),
        at.format("%H:%M:%S"),
    )
}

/// A single, immutable signing request.
///
/// Built once per trigger by [`crate::config::SignerConfig::intent_for`] and
/// only ever shared by reference afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningIntent {
    pub input_path: PathBuf,
    pub keystore: KeystoreSource,
    pub certificate_alias: Option<String>,
    pub owner_password: Option<Secret>,
    pub user_password: Option<Secret>,
    pub permissions: PermissionFlags,
    pub certification_level: Option<CertificationLevel>,
    pub timestamp_authority_url: Option<String>,
    pub output_suffix: String,
    pub output_directory: Option<PathBuf>,
    pub signature_name: String,
    pub visible_signature: Option<VisibleSignature>,
}

impl SigningIntent {
    /// Minimal intent: default suffix, no options.
    pub fn new(input_path: impl Into<PathBuf>, keystore: KeystoreSource) -> Self {
        Self {
            input_path: input_path.into(),
            keystore,
            certificate_alias: None,
            owner_password: None,
            user_password: None,
            permissions: PermissionFlags::default(),
            certification_level: None,
            timestamp_authority_url: None,
            output_suffix: DEFAULT_OUTPUT_SUFFIX.to_string(),
            output_directory: None,
            signature_name: DEFAULT_SIGNATURE_NAME.to_string(),
            visible_signature: None,
        }
    }

    /// Directory the signed file is written to.
    #[must_use]
    pub fn resolved_output_directory(&self) -> PathBuf {
        match &self.output_directory {
            Some(dir) => dir.clone(),
            None => self
                .input_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
        }
    }

    /// `output_directory/<stem><suffix>.pdf`
    #[must_use]
    pub fn output_path(&self) -> PathBuf {
        let stem = self
            .input_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.resolved_output_directory()
            .join(format!("{stem}{}.pdf", self.output_suffix))
    }

    #[must_use]
    pub fn alias(&self) -> Option<&str> {
        self.certificate_alias
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
    }

    #[must_use]
    pub fn timestamp_url(&self) -> Option<&str> {
        self.timestamp_authority_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
    }

    #[must_use]
    pub fn owner_password(&self) -> Option<&Secret> {
        non_empty(self.owner_password.as_ref())
    }

    #[must_use]
    pub fn user_password(&self) -> Option<&Secret> {
        non_empty(self.user_password.as_ref())
    }

    /// Check every structural rule. Does not touch the filesystem.
    pub fn validate(&self) -> Result<()> {
        let input = self
            .input_path
            .to_str()
            .ok_or_else(|| SignError::config("Input path is not valid UTF-8"))?;
        if input.trim().is_empty() {
            return Err(SignError::config("Input PDF path is required"));
        }
        if !self.input_path.is_absolute() {
            return Err(SignError::config(format!(
                "Input PDF path must be absolute: {input}"
            )));
        }
        if self.input_path.file_stem().is_none() {
            return Err(SignError::config(format!(
                "Input PDF path has no file name: {input}"
            )));
        }

        if let KeystoreSource::Pkcs11 { config_path, .. } = &self.keystore {
            if config_path.as_os_str().is_empty() {
                return Err(SignError::config(
                    "PKCS#11 keystore selected but no provider config path was given",
                ));
            }
            if config_path.to_str().is_none() {
                return Err(SignError::config("PKCS#11 config path is not valid UTF-8"));
            }
        }

        if self.output_suffix.contains(['/', '\\']) {
            return Err(SignError::config(format!(
                "Output suffix must not contain path separators: '{}'",
                self.output_suffix
            )));
        }

        let output_dir = self.resolved_output_directory();
        if output_dir.to_str().is_none() {
            return Err(SignError::config("Output directory is not valid UTF-8"));
        }
        let same_dir = self
            .input_path
            .parent()
            .is_some_and(|parent| parent == output_dir);
        if same_dir && self.output_suffix.is_empty() {
            return Err(SignError::config(
                "Output suffix must not be empty when writing next to the input file \
                 (the original would be overwritten)",
            ));
        }
        if self.output_path() == self.input_path {
            return Err(SignError::config(
                "Output path resolves to the input file; refusing to overwrite the original",
            ));
        }

        if self.permissions.disable_printing && self.permissions.degraded_printing {
            return Err(SignError::config(
                "disable_printing and degraded_printing are mutually exclusive",
            ));
        }

        if let Some(url) = self.timestamp_url()
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            return Err(SignError::config(format!(
                "Timestamp authority URL must be http(s): '{url}'"
            )));
        }

        if let Some(visible) = &self.visible_signature {
            if visible.page == 0 {
                return Err(SignError::config("Visible signature page must be 1 or greater"));
            }
            if let Some(image) = &visible.image
                && image.to_str().is_none()
            {
                return Err(SignError::config("Signature image path is not valid UTF-8"));
            }
        }

        Ok(())
    }
}
