//! TTL policy records and their resolution.
//!
//! Every settings record is addressed by a [`ScopeKey`]. A field that is
//! `None` inherits from the parent scope; an explicit [`TtlSetting::Forever`]
//! means "never expire" and is a different state from inheriting. At the
//! storage layer NULL maps to inherit and `-1` to forever.

/// Sentinel stored in the database for an explicit "forever" TTL.
pub const FOREVER_TTL_SENTINEL: i64 = -1;

/// System default when no scope sets a TTL: messages live forever.
pub const DEFAULT_MESSAGE_TTL: Option<u32> = None;
/// System default lower bound applied to user-level TTLs.
pub const DEFAULT_MIN_MESSAGE_TTL: Option<u32> = Some(30);
/// System default upper bound: unbounded.
pub const DEFAULT_MAX_MESSAGE_TTL: Option<u32> = None;
/// Pinned messages are kept unless a scope opts in.
pub const DEFAULT_INCLUDE_PINS: bool = false;

/// Composite identifier addressing a settings record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKey {
    Server { server_id: u64 },
    ServerChannel { server_id: u64, channel_id: u64 },
    User { user_id: u64 },
    UserServer { user_id: u64, server_id: u64 },
    UserServerChannel { user_id: u64, server_id: u64, channel_id: u64 },
}

impl ScopeKey {
    /// The next scope up the same branch, if any.
    pub fn parent(&self) -> Option<ScopeKey> {
        match *self {
            ScopeKey::Server { .. } | ScopeKey::User { .. } => None,
            ScopeKey::ServerChannel { server_id, .. } => Some(ScopeKey::Server { server_id }),
            ScopeKey::UserServer { user_id, .. } => Some(ScopeKey::User { user_id }),
            ScopeKey::UserServerChannel { user_id, server_id, .. } => {
                Some(ScopeKey::UserServer { user_id, server_id })
            }
        }
    }

    pub fn server_id(&self) -> Option<u64> {
        match *self {
            ScopeKey::Server { server_id }
            | ScopeKey::ServerChannel { server_id, .. }
            | ScopeKey::UserServer { server_id, .. }
            | ScopeKey::UserServerChannel { server_id, .. } => Some(server_id),
            ScopeKey::User { .. } => None,
        }
    }

    pub fn channel_id(&self) -> Option<u64> {
        match *self {
            ScopeKey::ServerChannel { channel_id, .. }
            | ScopeKey::UserServerChannel { channel_id, .. } => Some(channel_id),
            _ => None,
        }
    }

    pub fn user_id(&self) -> Option<u64> {
        match *self {
            ScopeKey::User { user_id }
            | ScopeKey::UserServer { user_id, .. }
            | ScopeKey::UserServerChannel { user_id, .. } => Some(user_id),
            _ => None,
        }
    }
}

/// An explicitly configured TTL value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlSetting {
    /// Messages never expire.
    Forever,
    /// Messages expire after this many seconds.
    Seconds(u32),
}

#[derive(Debug, thiserror::Error)]
pub enum TtlParseError {
    #[error("invalid duration: {0}")]
    Duration(#[from] humantime::DurationError),
    #[error("ttl must be at least 1 second")]
    TooShort,
    #[error("ttl is too large")]
    TooLarge,
}

impl TtlSetting {
    /// Parses user input such as `2h`, `7d 12h` or the literal `forever`.
    pub fn parse(input: &str) -> Result<TtlSetting, TtlParseError> {
        let input = input.trim();
        if input.eq_ignore_ascii_case("forever") {
            return Ok(TtlSetting::Forever);
        }
        let duration = humantime::parse_duration(input)?;
        if duration.as_secs() < 1 {
            return Err(TtlParseError::TooShort);
        }
        let secs = u32::try_from(duration.as_secs()).map_err(|_| TtlParseError::TooLarge)?;
        Ok(TtlSetting::Seconds(secs))
    }

    /// `None` for forever, otherwise the TTL in seconds.
    pub fn as_secs(&self) -> Option<u32> {
        match *self {
            TtlSetting::Forever => None,
            TtlSetting::Seconds(secs) => Some(secs),
        }
    }
}

impl std::fmt::Display for TtlSetting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            TtlSetting::Forever => write!(f, "forever"),
            TtlSetting::Seconds(secs) => {
                write!(f, "{}", humantime::format_duration(std::time::Duration::from_secs(secs.into())))
            }
        }
    }
}

/// Maps a TTL field to its database representation: NULL = inherit,
/// `-1` = explicit forever, otherwise seconds.
pub fn ttl_to_db(ttl: Option<TtlSetting>) -> Option<i64> {
    ttl.map(|t| match t {
        TtlSetting::Forever => FOREVER_TTL_SENTINEL,
        TtlSetting::Seconds(secs) => i64::from(secs),
    })
}

/// Inverse of [`ttl_to_db`]. Negative or oversized stored values collapse to
/// the forever sentinel rather than wrapping.
pub fn ttl_from_db(raw: Option<i64>) -> Option<TtlSetting> {
    raw.map(|value| match u32::try_from(value) {
        Ok(secs) => TtlSetting::Seconds(secs),
        Err(_) => TtlSetting::Forever,
    })
}

/// A partially specified TTL policy at one scope. `None` fields inherit from
/// the parent scope when resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsRecord {
    pub scope: ScopeKey,
    pub default_message_ttl: Option<TtlSetting>,
    pub max_message_ttl: Option<TtlSetting>,
    pub min_message_ttl: Option<TtlSetting>,
    pub include_pins: Option<bool>,
}

impl SettingsRecord {
    /// An all-inheriting record for the given scope. Defaults are virtual:
    /// they are handed out by the store but never persisted.
    pub fn new(scope: ScopeKey) -> Self {
        Self {
            scope,
            default_message_ttl: None,
            max_message_ttl: None,
            min_message_ttl: None,
            include_pins: None,
        }
    }

    /// Returns `true` if every field inherits.
    pub fn is_default(&self) -> bool {
        self.default_message_ttl.is_none()
            && self.max_message_ttl.is_none()
            && self.min_message_ttl.is_none()
            && self.include_pins.is_none()
    }

    /// Field-wise merge: every explicit field on `self` wins over `parent`.
    /// The result keeps `self`'s scope. Pure and total.
    pub fn apply_parent(&self, parent: &SettingsRecord) -> SettingsRecord {
        SettingsRecord {
            scope: self.scope,
            default_message_ttl: self.default_message_ttl.or(parent.default_message_ttl),
            max_message_ttl: self.max_message_ttl.or(parent.max_message_ttl),
            min_message_ttl: self.min_message_ttl.or(parent.min_message_ttl),
            include_pins: self.include_pins.or(parent.include_pins),
        }
    }

    /// Resolves remaining inherited fields against the system defaults.
    pub fn into_effective(self) -> EffectiveSettings {
        EffectiveSettings {
            message_ttl: match self.default_message_ttl {
                None => DEFAULT_MESSAGE_TTL,
                Some(ttl) => ttl.as_secs(),
            },
            min_message_ttl: match self.min_message_ttl {
                None => DEFAULT_MIN_MESSAGE_TTL,
                Some(ttl) => ttl.as_secs(),
            },
            max_message_ttl: match self.max_message_ttl {
                None => DEFAULT_MAX_MESSAGE_TTL,
                Some(ttl) => ttl.as_secs(),
            },
            include_pins: self.include_pins.unwrap_or(DEFAULT_INCLUDE_PINS),
        }
    }
}

/// A fully resolved policy: no inheritance left. `None` TTLs mean forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveSettings {
    pub message_ttl: Option<u32>,
    pub min_message_ttl: Option<u32>,
    pub max_message_ttl: Option<u32>,
    pub include_pins: bool,
}

impl EffectiveSettings {
    /// Clamps a user-level TTL against this policy's min/max bounds.
    pub fn clamp_user_ttl(&self, user_ttl: Option<u32>) -> Option<u32> {
        clamp_user_ttl(user_ttl, self.min_message_ttl, self.max_message_ttl)
    }
}

/// Combines a numeric user TTL with server-level clamps. `None` means
/// forever on every side. A min bound overrides an unset or shorter user
/// TTL; a max bound caps everything else.
pub fn clamp_user_ttl(user_ttl: Option<u32>, min: Option<u32>, max: Option<u32>) -> Option<u32> {
    if let Some(min) = min {
        match user_ttl {
            None => return Some(min),
            Some(user) if min > user => return Some(min),
            _ => {}
        }
    }
    match (user_ttl, max) {
        (user, None) => user,
        (Some(user), Some(max)) if user <= max => Some(user),
        (_, Some(max)) => Some(max),
    }
}

/// Resolves a user's merged settings chain against the already-effective
/// server/channel policy. A user TTL left unset inherits the server policy
/// untouched; an explicit user TTL (forever included) is clamped against the
/// server's min/max bounds.
pub fn resolve_user_effective(
    user_chain: &SettingsRecord,
    server_effective: &EffectiveSettings,
) -> EffectiveSettings {
    let message_ttl = match user_chain.default_message_ttl {
        None => server_effective.message_ttl,
        Some(ttl) => server_effective.clamp_user_ttl(ttl.as_secs()),
    };
    EffectiveSettings {
        message_ttl,
        min_message_ttl: server_effective.min_message_ttl,
        max_message_ttl: server_effective.max_message_ttl,
        include_pins: user_chain.include_pins.unwrap_or(server_effective.include_pins),
    }
}
