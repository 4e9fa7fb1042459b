//! Capture->player mapping of opaque raytracing shader identifiers.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use crate::d3d12::SHADER_IDENTIFIER_SIZE;
use crate::key::CommandKey;

/// A 32-byte opaque shader identifier as returned by `GetShaderIdentifier`.
#[repr(transparent)]
#[derive(
    Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Pod, Zeroable, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ShaderIdentifier(pub [u8; SHADER_IDENTIFIER_SIZE]);

impl ShaderIdentifier {
    /// The identifier as four little-endian 64-bit words, the unit the patching kernel compares.
    pub fn words(&self) -> [u64; 4] {
        let mut words = [0u64; 4];
        for (word, chunk) in words.iter_mut().zip(self.0.chunks_exact(8)) {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            *word = u64::from_le_bytes(bytes);
        }
        words
    }

    pub fn read(bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..SHADER_IDENTIFIER_SIZE)?;
        Some(bytemuck::pod_read_unaligned(bytes))
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl fmt::Debug for ShaderIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.words();
        write!(f, "ShaderIdentifier({a:016x}:{b:016x}:{c:016x}:{d:016x})")
    }
}

/// One row of the shader identifier patch table.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ShaderIdentifierMapping {
    pub capture: ShaderIdentifier,
    pub player: ShaderIdentifier,
}

/// Bidirectional registry of shader identifiers.
///
/// Replay learns the player identifier one `GetShaderIdentifier` call at a time, in capture
/// order, so both halves are keyed by the command that produced them.
#[derive(Clone, Debug, Default)]
pub struct ShaderIdentifierRegistry {
    capture: BTreeMap<CommandKey, ShaderIdentifier>,
    /// First command that returned each capture identifier.
    capture_commands: HashMap<ShaderIdentifier, CommandKey>,
    player: BTreeMap<CommandKey, ShaderIdentifier>,
    dump_lookup: bool,
    capture_export_names: HashMap<ShaderIdentifier, String>,
    player_export_names: HashMap<ShaderIdentifier, String>,
}

impl ShaderIdentifierRegistry {
    /// With `dump_lookup` set, export names are retained so identifiers can be printed by name.
    pub fn new(dump_lookup: bool) -> Self {
        Self {
            dump_lookup,
            ..Self::default()
        }
    }

    pub fn add_capture(
        &mut self,
        command: CommandKey,
        identifier: ShaderIdentifier,
        export_name: &str,
    ) {
        self.capture.insert(command, identifier);
        self.capture_commands.entry(identifier).or_insert(command);
        if self.dump_lookup {
            self.capture_export_names
                .insert(identifier, export_name.to_string());
        }
    }

    pub fn add_player(
        &mut self,
        command: CommandKey,
        identifier: ShaderIdentifier,
        export_name: &str,
    ) {
        self.player.insert(command, identifier);
        if self.dump_lookup {
            self.player_export_names
                .insert(identifier, export_name.to_string());
        }
    }

    pub fn capture_export_name(&self, identifier: &ShaderIdentifier) -> Option<&str> {
        self.capture_export_names
            .get(identifier)
            .map(String::as_str)
    }

    pub fn player_export_name(&self, identifier: &ShaderIdentifier) -> Option<&str> {
        self.player_export_names.get(identifier).map(String::as_str)
    }

    /// Player identifier for `capture`, if the producing command has been replayed.
    pub fn translate(&self, capture: &ShaderIdentifier) -> Option<ShaderIdentifier> {
        let command = self.capture_commands.get(capture)?;
        self.player.get(command).copied()
    }

    /// Resolved pairs sorted by the capture identifier's 64-bit words.
    ///
    /// The order is the one the replay-time binary search kernel expects.
    pub fn mappings(&self) -> Vec<ShaderIdentifierMapping> {
        let mut rows: Vec<ShaderIdentifierMapping> = self
            .capture
            .iter()
            .filter_map(|(command, capture)| {
                Some(ShaderIdentifierMapping {
                    capture: *capture,
                    player: *self.player.get(command)?,
                })
            })
            .collect();
        rows.sort_by_key(|row| row.capture.words());
        rows.dedup_by_key(|row| row.capture);
        rows
    }
}
