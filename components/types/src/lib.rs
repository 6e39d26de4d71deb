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

pub mod attr;
pub mod entry;
pub mod ino;
pub mod stat;

pub use fuser::FileType;

pub type Errno = libc::c_int;

/// Converts an error into the errno replied to the kernel.
pub trait ToErrno {
    fn to_errno(&self) -> Errno;
}
