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

use snafu::{Location, Snafu};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("unsupported meta dsn {dsn}, {location}"))]
    UnsupportedMetaDSN {
        #[snafu(implicit)]
        location: Location,
        dsn:      String,
    },

    #[snafu(display("invalid capacity in meta dsn {dsn}: {source}"))]
    InvalidCapacity {
        #[snafu(implicit)]
        location: Location,
        dsn:      String,
        source:   std::num::ParseIntError,
    },
}
