// Copyright 2024 tessera
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// The node id handed to the kernel. It is allocated by the client and is
/// unrelated to the backend inode number.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Ino(pub u64);

pub const ROOT_INO: Ino = Ino(1);
/// The first id given out to a node that is not the root.
pub const FIRST_CHILD_INO: Ino = Ino(2);
/// Reported as `d_ino` for a listed name that has no node in memory.
pub const UNKNOWN_INO: Ino = Ino(0xffff_ffff);

impl From<u64> for Ino {
    fn from(value: u64) -> Self { Self(value) }
}

impl From<Ino> for u64 {
    fn from(value: Ino) -> Self { value.0 }
}

impl Display for Ino {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { write!(f, "{}", self.0) }
}
