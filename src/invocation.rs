//! Translate a [`SigningIntent`] into the JSignPdf argument vector.
//!
//! The builder is pure: it reads nothing from disk and the same intent always
//! yields the same tokens. Secrets are carried as [`Arg::Secret`] so that a
//! redacted rendering can be logged while the real values are handed to the
//! child process.

use crate::error::Result;
use crate::intent::{KeystoreSource, SigningIntent};
use crate::secret::{REDACTED, Secret, non_empty};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

// ============================================================================
// JSIGNPDF FLAG VOCABULARY
// ============================================================================

pub const KEYSTORE_TYPE: &str = "-kst";
pub const KEYSTORE_FILE: &str = "-ksf";
pub const KEYSTORE_PASSWORD: &str = "-ksp";
pub const KEY_ALIAS: &str = "-ka";
pub const LIST_KEYS: &str = "-lk";
pub const CERT_LEVEL: &str = "-cl";
pub const ENCRYPTION: &str = "-pe";
pub const OWNER_PASSWORD: &str = "-opwd";
pub const USER_PASSWORD: &str = "-upwd";
pub const PRINT_RIGHT: &str = "-pr";
pub const TSA_URL: &str = "-ts";
pub const SIGNER_NAME: &str = "-sn";
pub const VISIBLE: &str = "-V";
pub const PAGE: &str = "-pg";
pub const LLX: &str = "-llx";
pub const LLY: &str = "-lly";
pub const URX: &str = "-urx";
pub const URY: &str = "-ury";
pub const FONT_SIZE: &str = "-fs";
pub const L2_TEXT: &str = "--l2-text";
pub const IMAGE_PATH: &str = "--img-path";
pub const RENDER_MODE: &str = "--render-mode";
pub const OUT_SUFFIX: &str = "-os";
pub const OUT_DIRECTORY: &str = "-d";

pub const DISABLE_COPY: &str = "--disable-copy";
pub const DISABLE_MODIFY_CONTENT: &str = "--disable-modify-content";
pub const DISABLE_MODIFY_ANNOTATIONS: &str = "--disable-modify-annotations";
pub const DISABLE_FILL: &str = "--disable-fill";
pub const DISABLE_SCREEN_READERS: &str = "--disable-screen-readers";
pub const DISABLE_ASSEMBLY: &str = "--disable-assembly";

pub const KEYSTORE_WINDOWS_MY: &str = "WINDOWS-MY";
pub const KEYSTORE_PKCS11: &str = "PKCS11";
pub const ENCRYPTION_PASSWORD: &str = "PASSWORD";
pub const DISALLOW_PRINTING: &str = "DISALLOW_PRINTING";
pub const ALLOW_DEGRADED_PRINTING: &str = "ALLOW_DEGRADED_PRINTING";
pub const RENDER_GRAPHIC_AND_DESCRIPTION: &str = "GRAPHIC_AND_DESCRIPTION";
pub const VISIBLE_FONT_SIZE: &str = "10";

/// One command-line token.
#[derive(Clone, PartialEq, Eq)]
pub enum Arg {
    Plain(String),
    Secret(Secret),
}

impl Arg {
    #[must_use]
    pub fn exposed(&self) -> &str {
        match self {
            Self::Plain(s) => s,
            Self::Secret(s) => s.expose(),
        }
    }

    #[must_use]
    pub fn redacted(&self) -> &str {
        match self {
            Self::Plain(s) => s,
            Self::Secret(_) => REDACTED,
        }
    }
}

impl fmt::Debug for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.redacted())
    }
}

/// How to start the signing tool: a program plus arguments that precede the
/// built tokens (`java -jar JSignPdf.jar`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolLocation {
    pub program: PathBuf,
    pub leading_args: Vec<String>,
}

impl ToolLocation {
    pub fn jsignpdf(java: impl Into<PathBuf>, jar: &Path) -> Self {
        Self {
            program: java.into(),
            leading_args: vec!["-jar".to_string(), jar.to_string_lossy().into_owned()],
        }
    }
}

/// A fully built external command.
#[derive(Clone, PartialEq, Eq)]
pub struct Invocation {
    tool: ToolLocation,
    args: Vec<Arg>,
}

impl Invocation {
    /// A command made only of the tool location, for helpers that are not the
    /// signing tool itself.
    #[must_use]
    pub fn from_tool(tool: ToolLocation) -> Self {
        Self {
            tool,
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn program(&self) -> &Path {
        &self.tool.program
    }

    /// Tokens produced by the builder, excluding the tool's leading arguments.
    #[must_use]
    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    /// Real argument vector handed to the child process.
    #[must_use]
    pub fn exec_args(&self) -> Vec<OsString> {
        self.tool
            .leading_args
            .iter()
            .map(OsString::from)
            .chain(self.args.iter().map(|a| OsString::from(a.exposed())))
            .collect()
    }

    /// Builder tokens with secrets in clear. Never log this.
    #[must_use]
    pub fn exposed_args(&self) -> Vec<String> {
        self.args.iter().map(|a| a.exposed().to_string()).collect()
    }

    /// Builder tokens with every secret masked.
    #[must_use]
    pub fn redacted_args(&self) -> Vec<String> {
        self.args.iter().map(|a| a.redacted().to_string()).collect()
    }

    /// Full command line, secrets masked, tokens with spaces quoted.
    #[must_use]
    pub fn redacted_command_line(&self) -> String {
        std::iter::once(self.tool.program.to_string_lossy().into_owned())
            .chain(self.tool.leading_args.iter().cloned())
            .chain(self.redacted_args())
            .map(|token| {
                if token.contains(char::is_whitespace) {
                    format!("\"{}\"", token.replace('\n', "\\n"))
                } else {
                    token
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted_command_line())
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("command", &self.redacted_command_line())
            .finish()
    }
}

struct Tokens(Vec<Arg>);

impl Tokens {
    fn flag(&mut self, flag: &str) {
        self.0.push(Arg::Plain(flag.to_string()));
    }

    fn pair(&mut self, flag: &str, value: impl Into<String>) {
        self.flag(flag);
        self.0.push(Arg::Plain(value.into()));
    }

    fn secret(&mut self, flag: &str, value: &Secret) {
        self.flag(flag);
        self.0.push(Arg::Secret(value.clone()));
    }
}

fn keystore_tokens(tokens: &mut Tokens, keystore: &KeystoreSource) {
    match keystore {
        KeystoreSource::WindowsStore => tokens.pair(KEYSTORE_TYPE, KEYSTORE_WINDOWS_MY),
        KeystoreSource::Pkcs11 { config_path, pin } => {
            tokens.pair(KEYSTORE_TYPE, KEYSTORE_PKCS11);
            tokens.pair(KEYSTORE_FILE, config_path.to_string_lossy());
            if let Some(pin) = non_empty(pin.as_ref()) {
                tokens.secret(KEYSTORE_PASSWORD, pin);
            }
        }
    }
}

/// Build the signing command for `intent`.
///
/// The whole intent is validated first; on error no tokens exist.
pub fn build(intent: &SigningIntent, tool: &ToolLocation) -> Result<Invocation> {
    intent.validate()?;

    let mut tokens = Tokens(Vec::new());

    keystore_tokens(&mut tokens, &intent.keystore);

    if let Some(alias) = intent.alias() {
        tokens.pair(KEY_ALIAS, alias);
    }

    if let Some(level) = intent.certification_level {
        tokens.pair(CERT_LEVEL, level.as_tool_str());
    }

    let perms = &intent.permissions;
    if perms.disable_copy {
        tokens.flag(DISABLE_COPY);
    }
    if perms.disable_modify_content {
        tokens.flag(DISABLE_MODIFY_CONTENT);
    }
    if perms.disable_modify_annotations {
        tokens.flag(DISABLE_MODIFY_ANNOTATIONS);
    }
    if perms.disable_fill {
        tokens.flag(DISABLE_FILL);
    }
    if perms.disable_screen_readers {
        tokens.flag(DISABLE_SCREEN_READERS);
    }
    if perms.disable_assembly {
        tokens.flag(DISABLE_ASSEMBLY);
    }
    if perms.disable_printing {
        tokens.pair(PRINT_RIGHT, DISALLOW_PRINTING);
    } else if perms.degraded_printing {
        tokens.pair(PRINT_RIGHT, ALLOW_DEGRADED_PRINTING);
    }

    let owner = intent.owner_password();
    let user = intent.user_password();
    if owner.is_some() || user.is_some() {
        tokens.pair(ENCRYPTION, ENCRYPTION_PASSWORD);
    }
    if let Some(owner) = owner {
        tokens.secret(OWNER_PASSWORD, owner);
    }
    if let Some(user) = user {
        tokens.secret(USER_PASSWORD, user);
    }

    if let Some(url) = intent.timestamp_url() {
        tokens.pair(TSA_URL, url);
    }

    if !intent.signature_name.trim().is_empty() {
        tokens.pair(SIGNER_NAME, intent.signature_name.trim());
    }

    if let Some(visible) = &intent.visible_signature {
        let rect = visible.placement.rect();
        tokens.flag(VISIBLE);
        tokens.pair(PAGE, visible.page.to_string());
        tokens.pair(LLX, rect.llx.to_string());
        tokens.pair(LLY, rect.lly.to_string());
        tokens.pair(URX, rect.urx.to_string());
        tokens.pair(URY, rect.ury.to_string());
        tokens.pair(FONT_SIZE, VISIBLE_FONT_SIZE);
        if !visible.text.is_empty() {
            tokens.pair(L2_TEXT, visible.text.as_str());
        }
        if let Some(image) = &visible.image {
            tokens.pair(IMAGE_PATH, image.to_string_lossy());
            tokens.pair(RENDER_MODE, RENDER_GRAPHIC_AND_DESCRIPTION);
        }
    }

    tokens.pair(OUT_SUFFIX, intent.output_suffix.as_str());
    tokens.pair(OUT_DIRECTORY, intent.resolved_output_directory().to_string_lossy());

    // Positional input must trail every flag.
    tokens.0.push(Arg::Plain(intent.input_path.to_string_lossy().into_owned()));

    Ok(Invocation {
        tool: tool.clone(),
        args: tokens.0,
    })
}

/// Build a key-listing command (`-lk`) for the given keystore.
pub fn build_key_listing(keystore: &KeystoreSource, tool: &ToolLocation) -> Result<Invocation> {
    if let KeystoreSource::Pkcs11 { config_path, .. } = keystore
        && config_path.as_os_str().is_empty()
    {
        return Err(crate::error::SignError::config(
            "PKCS#11 keystore selected but no provider config path was given",
        ));
    }

    let mut tokens = Tokens(Vec::new());
    keystore_tokens(&mut tokens, keystore);
    tokens.flag(LIST_KEYS);

    Ok(Invocation {
        tool: tool.clone(),
        args: tokens.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SignError;
    use crate::intent::{CertificationLevel, Placement, VisibleSignature};

    fn input() -> PathBuf {
        if cfg!(windows) {
            PathBuf::from(r"C:\docs\report.pdf")
        } else {
            PathBuf::from("/docs/report.pdf")
        }
    }

    fn tool() -> ToolLocation {
        ToolLocation::jsignpdf("java", Path::new("/opt/jsignpdf/JSignPdf.jar"))
    }

    fn pkcs11_intent(pin: Option<&str>) -> SigningIntent {
        SigningIntent::new(
            input(),
            KeystoreSource::Pkcs11 {
                config_path: PathBuf::from("/etc/pkcs11/token.cfg"),
                pin: pin.map(Secret::new),
            },
        )
    }

    fn count(args: &[String], token: &str) -> usize {
        args.iter().filter(|a| a.as_str() == token).count()
    }

    #[test]
    fn test_windows_store_minimal() {
        let intent = SigningIntent::new(input(), KeystoreSource::WindowsStore);
        let inv = build(&intent, &tool()).unwrap();
        let args = inv.exposed_args();
        assert_eq!(&args[..2], &["-kst", "WINDOWS-MY"]);
        assert_eq!(count(&args, OUT_SUFFIX), 1);
        assert_eq!(count(&args, OUT_DIRECTORY), 1);
        assert_eq!(args.last().unwrap(), &input().to_string_lossy());
        assert!(args.iter().all(|a| !a.is_empty()));
        assert_eq!(count(&args, ENCRYPTION), 0);
    }

    #[test]
    fn test_pkcs11_tokens_first_and_pin_optional() {
        let inv = build(&pkcs11_intent(None), &tool()).unwrap();
        let args = inv.exposed_args();
        assert_eq!(&args[..4], &["-kst", "PKCS11", "-ksf", "/etc/pkcs11/token.cfg"]);
        assert_eq!(count(&args, KEYSTORE_PASSWORD), 0);

        let inv = build(&pkcs11_intent(Some("")), &tool()).unwrap();
        assert_eq!(count(&inv.exposed_args(), KEYSTORE_PASSWORD), 0);

        let inv = build(&pkcs11_intent(Some("123456")), &tool()).unwrap();
        assert_eq!(&inv.exposed_args()[4..6], &["-ksp", "123456"]);
    }

    #[test]
    fn test_pkcs11_without_config_fails_before_tokens() {
        let intent = SigningIntent::new(
            input(),
            KeystoreSource::Pkcs11 {
                config_path: PathBuf::new(),
                pin: Some(Secret::new("123456")),
            },
        );
        assert!(matches!(build(&intent, &tool()), Err(SignError::Configuration(_))));
    }

    #[test]
    fn test_redacted_rendering_hides_pin_and_passwords() {
        let mut intent = pkcs11_intent(Some("918273"));
        intent.owner_password = Some(Secret::new("Owner#Strong#987"));
        intent.user_password = Some(Secret::new("opensesame"));
        let inv = build(&intent, &tool()).unwrap();

        let redacted = inv.redacted_command_line();
        assert!(!redacted.contains("918273"));
        assert!(!redacted.contains("Owner#Strong#987"));
        assert!(!redacted.contains("opensesame"));
        assert!(redacted.contains(REDACTED));
        assert!(!format!("{inv}").contains("918273"));
        assert!(!format!("{inv:?}").contains("918273"));

        let exposed = inv.exposed_args();
        assert_eq!(count(&exposed, "918273"), 1);
        assert!(
            inv.exec_args()
                .iter()
                .any(|a| a.to_string_lossy() == "Owner#Strong#987")
        );
    }

    #[test]
    fn test_builder_is_deterministic() {
        let mut intent = pkcs11_intent(Some("123456"));
        intent.certificate_alias = Some("Jane Doe".into());
        intent.certification_level = Some(CertificationLevel::FormFilling);
        intent.permissions.disable_copy = true;
        intent.permissions.disable_fill = true;
        intent.timestamp_authority_url = Some("http://timestamp.digicert.com".into());
        intent.visible_signature = Some(VisibleSignature {
            page: 2,
            placement: Placement::BottomLeft,
            image: None,
            text: "Digitally signed\nby Jane Doe".into(),
        });

        let first = build(&intent, &tool()).unwrap();
        for _ in 0..5 {
            let again = build(&intent, &tool()).unwrap();
            assert_eq!(again.exposed_args(), first.exposed_args());
            assert_eq!(again.redacted_command_line(), first.redacted_command_line());
        }
    }

    #[test]
    fn test_certification_and_copy_restriction_each_once() {
        let mut intent = SigningIntent::new(input(), KeystoreSource::WindowsStore);
        intent.certification_level = Some(CertificationLevel::NoChangesAllowed);
        intent.permissions.disable_copy = true;
        let args = build(&intent, &tool()).unwrap().exposed_args();
        assert_eq!(count(&args, CERT_LEVEL), 1);
        assert_eq!(count(&args, "CERTIFIED_NO_CHANGES_ALLOWED"), 1);
        assert_eq!(count(&args, DISABLE_COPY), 1);
    }

    #[test]
    fn test_alias_and_tsa_omitted_when_blank() {
        let mut intent = SigningIntent::new(input(), KeystoreSource::WindowsStore);
        intent.certificate_alias = Some("   ".into());
        intent.timestamp_authority_url = Some(String::new());
        let args = build(&intent, &tool()).unwrap().exposed_args();
        assert_eq!(count(&args, KEY_ALIAS), 0);
        assert_eq!(count(&args, TSA_URL), 0);

        intent.certificate_alias = Some("Jane Doe".into());
        let args = build(&intent, &tool()).unwrap().exposed_args();
        let pos = args.iter().position(|a| a == KEY_ALIAS).unwrap();
        assert_eq!(args[pos + 1], "Jane Doe");
    }

    #[test]
    fn test_all_permission_flags_combine() {
        let mut intent = SigningIntent::new(input(), KeystoreSource::WindowsStore);
        intent.permissions.disable_copy = true;
        intent.permissions.disable_modify_content = true;
        intent.permissions.disable_modify_annotations = true;
        intent.permissions.disable_fill = true;
        intent.permissions.disable_screen_readers = true;
        intent.permissions.disable_assembly = true;
        intent.permissions.degraded_printing = true;
        let args = build(&intent, &tool()).unwrap().exposed_args();
        for flag in [
            DISABLE_COPY,
            DISABLE_MODIFY_CONTENT,
            DISABLE_MODIFY_ANNOTATIONS,
            DISABLE_FILL,
            DISABLE_SCREEN_READERS,
            DISABLE_ASSEMBLY,
            ALLOW_DEGRADED_PRINTING,
        ] {
            assert_eq!(count(&args, flag), 1, "{flag}");
        }
        assert_eq!(count(&args, DISALLOW_PRINTING), 0);
    }

    #[test]
    fn test_encryption_emitted_once_for_user_password_only() {
        let mut intent = SigningIntent::new(input(), KeystoreSource::WindowsStore);
        intent.user_password = Some(Secret::new("reader"));
        let args = build(&intent, &tool()).unwrap().exposed_args();
        assert_eq!(count(&args, ENCRYPTION), 1);
        assert_eq!(count(&args, OWNER_PASSWORD), 0);
        assert_eq!(count(&args, USER_PASSWORD), 1);
    }

    #[test]
    fn test_visible_signature_tokens() {
        let mut intent = SigningIntent::new(input(), KeystoreSource::WindowsStore);
        intent.visible_signature = Some(VisibleSignature {
            page: 3,
            placement: Placement::BottomRight,
            image: Some(PathBuf::from("/img/stamp.png")),
            text: "Digitally signed".into(),
        });
        let args = build(&intent, &tool()).unwrap().exposed_args();
        let pos = args.iter().position(|a| a == VISIBLE).unwrap();
        assert_eq!(
            &args[pos..pos + 13],
            &["-V", "-pg", "3", "-llx", "-276", "-lly", "36", "-urx", "-36", "-ury", "126", "-fs", "10"]
        );
        assert_eq!(count(&args, RENDER_GRAPHIC_AND_DESCRIPTION), 1);
        assert_eq!(args.last().unwrap(), &input().to_string_lossy());
    }

    #[test]
    fn test_exec_args_prefix_tool() {
        let intent = SigningIntent::new(input(), KeystoreSource::WindowsStore);
        let inv = build(&intent, &tool()).unwrap();
        let exec = inv.exec_args();
        assert_eq!(exec[0], "-jar");
        assert_eq!(exec[1], "/opt/jsignpdf/JSignPdf.jar");
        assert_eq!(exec.len(), inv.args().len() + 2);
        assert_eq!(inv.program(), Path::new("java"));
    }

    #[test]
    fn test_key_listing() {
        let inv = build_key_listing(&KeystoreSource::WindowsStore, &tool()).unwrap();
        assert_eq!(inv.exposed_args(), vec!["-kst", "WINDOWS-MY", "-lk"]);
    }
}
