//! Deoptimization tuning knobs.
//!
//! A single struct resolved once at startup: defaults, optionally overlaid by
//! a TOML file, then by `PRISM_DEOPT_*` environment variables.

use std::path::Path;

use serde::Deserialize;

use crate::error::{DeoptError, DeoptResult};
use crate::reason::DeoptReason;

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "PRISM_DEOPT_";

// =============================================================================
// DeoptConfig
// =============================================================================

/// Trap limits and elimination switches.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeoptConfig {
    /// Traps at one location, for one reason, before the location escalates
    /// to invalidating the code.
    pub per_bytecode_trap_limit: u32,
    /// Traps of one reason in one method before the method's code is
    /// invalidated regardless of location.
    pub per_method_trap_limit: u32,
    /// Like `per_method_trap_limit`, for speculative reasons.
    pub per_method_spec_trap_limit: u32,
    /// Recompilations caused by one location before the method becomes
    /// not compilable.
    pub per_bytecode_recompilation_cutoff: u32,
    /// Decompilations of one method before it becomes not compilable.
    pub per_method_recompilation_cutoff: u32,
    /// Create and update profiling data when traps fire.
    pub profile_traps: bool,
    /// Rematerialize scalar-replaced objects.
    pub eliminate_allocations: bool,
    /// Reacquire eliminated monitors.
    pub eliminate_locks: bool,
    /// Reuse box caches for eliminated boxing allocations.
    pub eliminate_auto_box: bool,
    /// Check unpacked interpreter frames against the unroll plan.
    pub verify_stack: bool,
    /// Per-method capacity of per-location trap records.
    pub extra_data_slots: u32,
}

impl Default for DeoptConfig {
    fn default() -> Self {
        Self {
            per_bytecode_trap_limit: 4,
            per_method_trap_limit: 100,
            per_method_spec_trap_limit: 5000,
            per_bytecode_recompilation_cutoff: 200,
            per_method_recompilation_cutoff: 400,
            profile_traps: true,
            eliminate_allocations: true,
            eliminate_locks: true,
            eliminate_auto_box: true,
            verify_stack: false,
            extra_data_slots: 32,
        }
    }
}

impl DeoptConfig {
    /// Small limits so tests reach escalation quickly.
    pub fn for_testing() -> Self {
        Self {
            per_bytecode_trap_limit: 2,
            per_method_trap_limit: 8,
            per_method_spec_trap_limit: 16,
            per_bytecode_recompilation_cutoff: 3,
            per_method_recompilation_cutoff: 6,
            verify_stack: true,
            extra_data_slots: 8,
            ..Self::default()
        }
    }

    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(source: &str) -> DeoptResult<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file.
    pub fn load(path: impl AsRef<Path>) -> DeoptResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| DeoptError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Apply `PRISM_DEOPT_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> DeoptResult<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    ///
    /// Keys are the upper-cased field names behind [`ENV_PREFIX`].
    pub fn with_overrides_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> DeoptResult<Self> {
        let get = |name: &str| {
            let key = format!("{ENV_PREFIX}{}", name.to_ascii_uppercase());
            lookup(&key).map(|value| (key, value))
        };

        macro_rules! override_u32 {
            ($($field:ident),* $(,)?) => {$(
                if let Some((key, value)) = get(stringify!($field)) {
                    self.$field = value
                        .trim()
                        .parse()
                        .map_err(|_| DeoptError::ConfigEnv { key, value })?;
                }
            )*};
        }
        macro_rules! override_bool {
            ($($field:ident),* $(,)?) => {$(
                if let Some((_, value)) = get(stringify!($field)) {
                    self.$field = env_bool(&value);
                }
            )*};
        }

        override_u32!(
            per_bytecode_trap_limit,
            per_method_trap_limit,
            per_method_spec_trap_limit,
            per_bytecode_recompilation_cutoff,
            per_method_recompilation_cutoff,
            extra_data_slots,
        );
        override_bool!(
            profile_traps,
            eliminate_allocations,
            eliminate_locks,
            eliminate_auto_box,
            verify_stack,
        );

        self.validate()?;
        Ok(self)
    }

    /// Reject values that would make the trap policy degenerate.
    pub fn validate(&self) -> DeoptResult<()> {
        let positive = [
            ("per_bytecode_trap_limit", self.per_bytecode_trap_limit),
            ("per_method_trap_limit", self.per_method_trap_limit),
            ("per_method_spec_trap_limit", self.per_method_spec_trap_limit),
            (
                "per_bytecode_recompilation_cutoff",
                self.per_bytecode_recompilation_cutoff,
            ),
            (
                "per_method_recompilation_cutoff",
                self.per_method_recompilation_cutoff,
            ),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(DeoptError::ConfigRange {
                    name,
                    value: 0,
                    reason: "must be positive",
                });
            }
        }
        if self.profile_traps && self.extra_data_slots == 0 {
            return Err(DeoptError::ConfigRange {
                name: "extra_data_slots",
                value: 0,
                reason: "trap profiling needs at least one slot",
            });
        }
        Ok(())
    }

    /// Per-method trap limit for `reason`.
    #[inline]
    pub fn per_method_trap_limit_for(&self, reason: DeoptReason) -> u32 {
        if reason.is_speculate() {
            self.per_method_spec_trap_limit
        } else {
            self.per_method_trap_limit
        }
    }
}

/// Truthiness of an environment value: empty and `0` are false.
fn env_bool(value: &str) -> bool {
    let value = value.trim();
    !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false")
}
