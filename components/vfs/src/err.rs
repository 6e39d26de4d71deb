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

use libc::c_int;
use snafu::{Location, Snafu};
use tessera_common::FH;
use tessera_meta::{BackendOp, ResultCode};
use tessera_types::{ino::Ino, Errno, ToErrno};
use tracing::debug;

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("{op}: no such entry"))]
    NotFound {
        op:       BackendOp,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{op}: entry already exists"))]
    AlreadyExists {
        op:       BackendOp,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("permission denied: {reason}"))]
    PermissionDenied {
        reason:   String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("volume is out of space"))]
    OutOfSpace {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{op} failed with {code}"))]
    IOError {
        op:       BackendOp,
        code:     ResultCode,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("short write, {written} of {expected} bytes"))]
    ShortWrite {
        written:  usize,
        expected: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("parent directory of {name:?} is gone"))]
    ParentGone {
        name:     String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("bad file handle {fh} for node {ino}"))]
    BadHandle {
        ino:      Ino,
        fh:       FH,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("unknown node {ino}"))]
    UnknownNode {
        ino:      Ino,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("node {ino} is not a directory"))]
    NotDirectory {
        ino:      Ino,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("node {ino} is a directory"))]
    IsDirectory {
        ino:      Ino,
        #[snafu(implicit)]
        location: Location,
    },

    LibcError {
        errno:    c_int,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl ToErrno for Error {
    fn to_errno(&self) -> Errno {
        match self {
            Self::NotFound { .. } | Self::UnknownNode { .. } => libc::ENOENT,
            Self::AlreadyExists { .. } => libc::EEXIST,
            Self::PermissionDenied { .. } => libc::EPERM,
            Self::OutOfSpace { .. } => libc::ENOSPC,
            Self::IOError { .. } | Self::ShortWrite { .. } | Self::ParentGone { .. } => libc::EIO,
            Self::BadHandle { .. } => libc::EBADF,
            Self::NotDirectory { .. } => libc::ENOTDIR,
            Self::IsDirectory { .. } => libc::EISDIR,
            Self::LibcError { errno, .. } => *errno,
        }
    }
}

/// How the result codes of one backend call are read.
#[derive(Default)]
struct CodeRule {
    /// `2` means the name or its parent is missing.
    not_found:    bool,
    /// `17` means the name is taken.
    exists:       bool,
    /// `-1` means the volume is full.
    out_of_space: bool,
    /// Codes reported as a permission failure, checked first.
    permission:   &'static [ResultCode],
}

fn code_rule(op: BackendOp) -> CodeRule {
    match op {
        BackendOp::StatByName | BackendOp::ListChildren => CodeRule {
            not_found: true,
            ..Default::default()
        },
        BackendOp::CreateFile => CodeRule {
            exists: true,
            ..Default::default()
        },
        BackendOp::CreateDir => CodeRule {
            not_found: true,
            exists: true,
            permission: &[ResultCode::NOT_PERMITTED],
            ..Default::default()
        },
        BackendOp::DeleteDir | BackendOp::DeleteFile => CodeRule {
            permission: &[ResultCode::NOT_FOUND, ResultCode::NOT_EMPTY],
            ..Default::default()
        },
        BackendOp::Rename => CodeRule {
            not_found: true,
            permission: &[ResultCode::NOT_PERMITTED, ResultCode::EXISTS],
            ..Default::default()
        },
        BackendOp::Write => CodeRule {
            out_of_space: true,
            ..Default::default()
        },
        _ => CodeRule::default(),
    }
}

/// Translates a failed backend call. Every dispatcher path goes through
/// here, anything the rule of `op` does not name is an I/O error.
#[track_caller]
pub(crate) fn backend_error(op: BackendOp, code: ResultCode) -> Error {
    let rule = code_rule(op);
    let err = if rule.permission.contains(&code) {
        PermissionDeniedSnafu {
            reason: format!("{op} answered {code}"),
        }
        .build()
    } else if rule.not_found && code == ResultCode::NOT_FOUND {
        NotFoundSnafu { op }.build()
    } else if rule.exists && code == ResultCode::EXISTS {
        AlreadyExistsSnafu { op }.build()
    } else if rule.out_of_space && code == ResultCode::FAILED {
        OutOfSpaceSnafu.build()
    } else {
        IOSnafu { op, code }.build()
    };
    debug!("{op} answered {code}: {err}");
    err
}
