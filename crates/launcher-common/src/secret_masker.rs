// Redaction of credentials from everything the launcher logs.

use parking_lot::RwLock;
use std::borrow::Cow;
use std::sync::Arc;

/// Replacement text used when a secret is found.
const MASK: &str = "***";

/// Shared, thread-safe set of secret values.
///
/// Clones share the same set: a token registered by one runner task is
/// masked in every trace handle of the process.
#[derive(Debug, Clone, Default)]
pub struct SecretMasker {
    // Kept sorted by length, longest first, so a secret containing another
    // secret is replaced whole.
    secrets: Arc<RwLock<Vec<String>>>,
}

impl SecretMasker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value to mask. Blank values are ignored.
    pub fn add_value(&self, secret: &str) {
        let secret = secret.trim();
        if secret.is_empty() {
            return;
        }

        let mut secrets = self.secrets.write();
        if secrets.iter().any(|s| s == secret) {
            return;
        }
        let at = secrets
            .iter()
            .position(|s| s.len() < secret.len())
            .unwrap_or(secrets.len());
        secrets.insert(at, secret.to_string());
    }

    /// Register several values at once.
    pub fn add_values<'a>(&self, values: impl IntoIterator<Item = &'a str>) {
        for value in values {
            self.add_value(value);
        }
    }

    /// Replace every registered secret in `input` with `***`.
    pub fn mask<'a>(&self, input: &'a str) -> Cow<'a, str> {
        let secrets = self.secrets.read();
        let mut output = Cow::Borrowed(input);
        for secret in secrets.iter() {
            if output.contains(secret.as_str()) {
                output = Cow::Owned(output.replace(secret.as_str(), MASK));
            }
        }
        output
    }

    pub fn secret_count(&self) -> usize {
        self.secrets.read().len()
    }
}
