//! Output parameter slots for RETURNVALUE tokens.
//!
//! The caller registers writable slots by parameter name before issuing an
//! RPC. Each RETURNVALUE in the response is matched by name (wire `@`
//! prefix stripped) and assigned into its slot; a failed assignment is
//! reported on the token channel without aborting the parse.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tds_tokens::SqlValue;

/// A writable output parameter slot.
#[derive(Debug, Clone)]
pub struct OutputSlot {
    value: Arc<Mutex<Option<SqlValue>>>,
    nullable: bool,
}

impl OutputSlot {
    /// A slot accepting any value including NULL.
    #[must_use]
    pub fn nullable() -> Self {
        Self {
            value: Arc::new(Mutex::new(None)),
            nullable: true,
        }
    }

    /// A slot rejecting NULL assignments.
    #[must_use]
    pub fn non_nullable() -> Self {
        Self {
            value: Arc::new(Mutex::new(None)),
            nullable: false,
        }
    }

    /// Assign the value delivered by a RETURNVALUE token.
    pub(crate) fn assign(&self, value: SqlValue) -> std::result::Result<(), String> {
        if value.is_null() && !self.nullable {
            return Err("can not write NULL into a non-nullable output parameter".into());
        }
        *self.value.lock() = Some(value);
        Ok(())
    }

    /// The assigned value, if the response carried one.
    #[must_use]
    pub fn get(&self) -> Option<SqlValue> {
        self.value.lock().clone()
    }
}

/// Named output parameter slots for one request.
#[derive(Debug, Clone, Default)]
pub struct Outputs {
    slots: Arc<HashMap<String, OutputSlot>>,
}

impl Outputs {
    /// No output parameters.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Build the output bag from named slots. Names are the parameter
    /// names without the `@` prefix.
    #[must_use]
    pub fn from_slots(slots: impl IntoIterator<Item = (String, OutputSlot)>) -> Self {
        Self {
            slots: Arc::new(slots.into_iter().collect()),
        }
    }

    /// Look up a slot by stripped parameter name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&OutputSlot> {
        self.slots.get(name)
    }
}
