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


use std::ffi::OsString;

use libc::c_int;
use snafu::{Location, Snafu};
use tessera_types::ToErrno;

pub type Result<T> = std::result::Result<T, FuseError>;

/// Requests refused before they reach the VFS.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum FuseError {
    #[snafu(display("invalid file name {:?}", name))]
    InvalidFileName {
        #[snafu(implicit)]
        location: Location,
        name:     OsString,
    },
    #[snafu(display("file name too long {:?}", name))]
    FilenameTooLong {
        #[snafu(implicit)]
        location: Location,
        name:     OsString,
    },
    #[snafu(display("unsupported rename flags {:#x}", flags))]
    UnsupportedRename {
        #[snafu(implicit)]
        location: Location,
        flags:    u32,
    },
}

impl ToErrno for FuseError {
    fn to_errno(&self) -> c_int {
        match self {
            FuseError::InvalidFileName { .. } | FuseError::UnsupportedRename { .. } => libc::EINVAL,
            FuseError::FilenameTooLong { .. } => libc::ENAMETOOLONG,
        }
    }
}
