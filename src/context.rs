// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Everything the ROM knows during one boot, in one place.

use tinycrc::Crc32Table;

use crate::bsp::Bsp;
use crate::km::{KeyManager, RootKeys};
use crate::ppm::Phase;
use crate::sp::wire::SUP_CRC;
use crate::sp::Session;

pub struct Context<B: Bsp> {
    pub board: B,
    pub otp: B::Otp,
    pub transport: B::Transport,
    pub crypto: B::Crypto,
    pub km: KeyManager,
    pub sup: Session,
    pub crc: Crc32Table,
    pub phase: Phase,
}

impl<B: Bsp> Context<B> {
    pub fn new(
        board: B,
        otp: B::Otp,
        transport: B::Transport,
        crypto: B::Crypto,
        roots: RootKeys,
    ) -> Self {
        Self {
            board,
            otp,
            transport,
            crypto,
            km: KeyManager::new(roots),
            sup: Session::new(),
            crc: Crc32Table::new(&SUP_CRC),
            phase: Phase::U,
        }
    }

    /// Zeroes validated keys and session buffers. Done before the platform
    /// is reset, shut down or handed over.
    pub fn wipe(&mut self) {
        self.km.wipe();
        self.sup.wipe();
        self.phase = Phase::U;
    }
}
