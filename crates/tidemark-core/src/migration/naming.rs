//! Script naming convention.
//!
//! | Prefix | Kind       | Example                     |
//! |--------|------------|-----------------------------|
//! | `V`    | Versioned  | `V1_2__add_users.sql`       |
//! | `R`    | Repeatable | `R__refresh_views.sql`      |
//! | `B`    | Baseline   | `B5__existing_schema.sql`   |
//! | `U`    | Undo       | `U1_2__add_users.sql`       |
//!
//! `_` inside a version is a separator (`1_2` is `1.2`); `_` inside a description is a space.

use super::descriptor::MigrationKind;
use super::error::{MigrationError, Result};
use crate::version::Version;
use wildmatch::WildMatch;

const SEPARATOR: &str = "__";
const SUFFIX: &str = ".sql";

/// The parts encoded in a script name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptName {
    /// Kind from the prefix.
    pub kind: MigrationKind,
    /// Version, absent for repeatables.
    pub version: Option<Version>,
    /// Description with underscores turned into spaces.
    pub description: String,
}

/// Parse a script file name. Leading directories are ignored.
pub fn parse_script_name(name: &str) -> Result<ScriptName> {
    let invalid = |reason: &str| MigrationError::InvalidScriptName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let file = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let stem = file
        .strip_suffix(SUFFIX)
        .ok_or_else(|| invalid("missing .sql suffix"))?;

    let mut chars = stem.chars();
    let kind = match chars.next() {
        Some('V') => MigrationKind::Versioned,
        Some('R') => MigrationKind::Repeatable,
        Some('B') => MigrationKind::Baseline,
        Some('U') => MigrationKind::Undo,
        _ => return Err(invalid("prefix must be one of V, R, B or U")),
    };
    let rest = chars.as_str();

    let (raw_version, raw_description) = rest
        .split_once(SEPARATOR)
        .ok_or_else(|| invalid("missing '__' between version and description"))?;
    let description = raw_description.replace('_', " ").trim().to_string();

    let version = if kind == MigrationKind::Repeatable {
        if !raw_version.is_empty() {
            return Err(invalid("repeatable migrations must not carry a version"));
        }
        if description.is_empty() {
            return Err(invalid("repeatable migrations need a description"));
        }
        None
    } else {
        if raw_version.is_empty() {
            return Err(invalid("missing version"));
        }
        Some(Version::parse(raw_version)?)
    };

    Ok(ScriptName {
        kind,
        version,
        description,
    })
}

/// Match `text` against a glob where `*` is any run of characters and `?` is one character.
pub fn glob_matches(pattern: &str, text: &str) -> bool {
    WildMatch::new(pattern).matches(text)
}
