//! Key commands: `genkey`, `pubkey`, `genpsk`.

use std::io::{BufRead, Write};

use wgadmin_core::keys;

use crate::error::CliError;
use crate::output::{KeyOutput, OutputFormat};

/// Which key to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// New private key.
    Private,
    /// Public key of a private key read from input.
    Public,
    /// New preshared key.
    Preshared,
}

/// Key command executor.
#[derive(Debug)]
pub struct KeyCommand {
    kind: KeyKind,
}

impl KeyCommand {
    /// Create a new key command.
    #[must_use]
    pub const fn new(kind: KeyKind) -> Self {
        Self { kind }
    }

    /// Execute the key command. `input` is read only for [`KeyKind::Public`].
    ///
    /// # Errors
    ///
    /// Returns an error if the input key is malformed or output fails.
    pub fn execute<R: BufRead, W: Write>(
        &self,
        input: &mut R,
        writer: &mut W,
        format: &OutputFormat,
    ) -> Result<(), CliError> {
        let key = match self.kind {
            KeyKind::Private => keys::generate_private_key(),
            KeyKind::Preshared => keys::generate_preshared_key(),
            KeyKind::Public => {
                let mut line = String::new();
                input.read_line(&mut line)?;
                keys::derive_public_key(line.trim())?
            }
        };
        format.write(writer, &KeyOutput { key })
    }
}
