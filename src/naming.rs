use uuid::Uuid;

/// Lifecycle class encoded in a pool VM's name.
///
/// A name is in exactly one class at any instant; renaming between classes
/// is the pool's sole state-transition mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VmClass {
    /// Build in progress (or crashed mid-build).
    Init,
    /// Ready for consumer pickup.
    Ready,
    /// Marked faulty; reaped by the janitor.
    Fault,
}

impl VmClass {
    /// The middle token of the wire format.
    pub fn token(self) -> &'static str {
        match self {
            Self::Init => "VMInit",
            Self::Ready => "VM2login",
            Self::Fault => "VMError",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "VMInit" => Some(Self::Init),
            "VM2login" => Some(Self::Ready),
            "VMError" => Some(Self::Fault),
            _ => None,
        }
    }
}

impl std::fmt::Display for VmClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

/// Build a pool VM name: `[<env>] <class>_<8 hex>`.
pub fn format_name(env: &str, class: VmClass, suffix: &str) -> String {
    format!("[{}] {}_{}", env, class.token(), suffix)
}

/// Parse a pool VM name back into its class and 8-hex suffix.
///
/// Returns `None` for anything outside the wire format or outside the given
/// environment — such VMs are ignored by the refiller.
pub fn parse_name(env: &str, name: &str) -> Option<(VmClass, String)> {
    let rest = name.strip_prefix('[')?;
    let (name_env, rest) = rest.split_once("] ")?;
    if name_env != env {
        return None;
    }
    let (token, suffix) = rest.rsplit_once('_')?;
    let class = VmClass::from_token(token)?;
    if suffix.len() != 8 || !suffix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
        return None;
    }
    Some((class, suffix.to_string()))
}

/// The clone source: the golden template carries the env prefix but no class.
pub fn golden_name(env: &str, golden: &str) -> String {
    format!("[{}] {}", env, golden)
}

/// Derive the stable 8-hex name suffix from a job id.
pub fn job_suffix(job_id: Uuid) -> String {
    job_id.simple().to_string()[..8].to_string()
}

/// Rename target for a class transition, preserving the suffix after the
/// last underscore of the current name.
pub fn with_class(env: &str, current_name: &str, class: VmClass) -> String {
    let suffix = current_name.rsplit('_').next().unwrap_or(current_name);
    format!("[{}] {}_{}", env, class.token(), suffix)
}
