// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Building and inspecting `.ipk` application packages.

An `.ipk` is an `ar` archive holding `debian-binary`, `control.tar.gz` and
`data.tar.gz`. The data tarball carries an application, its services and
package metadata laid out the way they are installed on the device, under
`usr/palm/`.

# A Tour of Functionality

[package::PackageRequest] describes a build and [package::PackageBuilder]
runs it. Manifests are loaded and validated by the [manifest] module before
anything is written. Sources are enumerated and copied by [files], with
optional JavaScript minification. [services] locates `services.json` files
and [assets] resolves the icons and images an application declares.

The staged tree is turned into an archive by [archive], which relies on the
[ar] module for the outer container and on [control] for the `control` file.
Packages can be signed ([signing]) and encrypted ([encrypt]). The CPU
architecture of native applications is read from ELF headers by [elf].

Existing packages are summarized by [inspect::analyze]. [device] verifies
package transfers over an abstract remote session.
*/

pub mod ar;
pub mod archive;
pub mod assets;
pub mod control;
pub mod device;
pub mod elf;
pub mod encrypt;
pub mod error;
pub mod files;
pub mod inspect;
pub mod manifest;
pub mod package;
pub mod properties;
pub mod services;
pub mod signing;

pub use {
    error::{ErrorKind, IpkError, Result},
    package::{check_inputs, BuildOutput, CheckSummary, PackageBuilder, PackageRequest},
};
