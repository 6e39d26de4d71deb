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

use strum_macros::{AsRefStr, Display, EnumIter};

/// The integer status every backend call answers with. Zero is success,
/// positive values follow errno numbering, negative values are generic
/// failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResultCode(pub i32);

impl ResultCode {
    pub const OK: ResultCode = ResultCode(0);
    /// Generic failure, and "out of space" when returned by a write.
    pub const FAILED: ResultCode = ResultCode(-1);
    pub const NOT_PERMITTED: ResultCode = ResultCode(1);
    pub const NOT_FOUND: ResultCode = ResultCode(2);
    pub const EXISTS: ResultCode = ResultCode(17);
    pub const NOT_DIR: ResultCode = ResultCode(20);
    pub const IS_DIR: ResultCode = ResultCode(21);
    pub const NOT_EMPTY: ResultCode = ResultCode(39);

    pub fn is_ok(self) -> bool { self == Self::OK }
}

impl Display for ResultCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { write!(f, "code {}", self.0) }
}

impl From<i32> for ResultCode {
    fn from(value: i32) -> Self { Self(value) }
}

pub type BackendResult<T> = std::result::Result<T, ResultCode>;

/// Names every call of the backend contract. Used to pick the result-code
/// translation rule and to label logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum BackendOp {
    StatByName,
    ListChildren,
    CreateFile,
    CreateDir,
    DeleteDir,
    DeleteFile,
    Rename,
    GetAttributes,
    OpenFile,
    NotifyAdditionalOpen,
    Read,
    Write,
    Flush,
    CloseConnections,
    VolumeInfo,
    ResolveLeader,
}
