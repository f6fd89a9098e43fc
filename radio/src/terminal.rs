//! User terminals and the cell that owns them.
//!
//! A [Cell] is an arena of [Terminal]s indexed by [TerminalId]. Each terminal owns its
//! bearers in order; a bearer refers back to its terminal only through its [BearerId].

use crate::{amc::ChannelModel, bearer::Bearer, BearerId, TerminalId};

/// A user terminal with its channel quality and bearers.
pub struct Terminal {
    id: TerminalId,
    cqi: u8,
    bearers: Vec<Bearer>,
}

impl Terminal {
    pub fn new(id: TerminalId, cqi: u8) -> Self {
        Self {
            id,
            cqi,
            bearers: Vec::new(),
        }
    }

    pub fn id(&self) -> TerminalId {
        self.id
    }

    /// Current channel-quality indicator.
    pub fn cqi(&self) -> u8 {
        self.cqi
    }

    pub fn set_cqi(&mut self, cqi: u8) {
        self.cqi = cqi;
    }

    /// Attach a bearer. Its identity must name this terminal and the next free index.
    pub fn attach(&mut self, bearer: Bearer) {
        let id = bearer.id();
        assert_eq!(id.terminal, self.id, "bearer attached to wrong terminal");
        assert_eq!(
            id.index as usize,
            self.bearers.len(),
            "bearer attached out of order"
        );
        self.bearers.push(bearer);
    }

    pub fn bearers(&self) -> &[Bearer] {
        &self.bearers
    }
}

/// The base station's view of every terminal and the channel model they share.
pub struct Cell {
    channel: ChannelModel,
    terminals: Vec<Terminal>,
}

impl Cell {
    pub fn new(channel: ChannelModel) -> Self {
        Self {
            channel,
            terminals: Vec::new(),
        }
    }

    pub fn channel(&self) -> &ChannelModel {
        &self.channel
    }

    /// Add a terminal. Its identity must be the next free index.
    pub fn add(&mut self, terminal: Terminal) {
        assert_eq!(
            terminal.id().0 as usize,
            self.terminals.len(),
            "terminal added out of order"
        );
        self.terminals.push(terminal);
    }

    pub fn terminals(&self) -> &[Terminal] {
        &self.terminals
    }

    pub fn terminals_mut(&mut self) -> &mut [Terminal] {
        &mut self.terminals
    }

    pub fn terminal(&self, id: TerminalId) -> Option<&Terminal> {
        self.terminals.get(id.0 as usize)
    }

    pub fn bearer(&self, id: BearerId) -> Option<&Bearer> {
        self.terminal(id.terminal)?.bearers.get(id.index as usize)
    }

    pub fn bearer_mut(&mut self, id: BearerId) -> Option<&mut Bearer> {
        self.terminals
            .get_mut(id.terminal.0 as usize)?
            .bearers
            .get_mut(id.index as usize)
    }

    /// Every bearer in identity order.
    pub fn bearers(&self) -> impl Iterator<Item = &Bearer> {
        self.terminals.iter().flat_map(|terminal| terminal.bearers.iter())
    }

    /// Every bearer in identity order, mutably.
    pub fn bearers_mut(&mut self) -> impl Iterator<Item = &mut Bearer> {
        self.terminals
            .iter_mut()
            .flat_map(|terminal| terminal.bearers.iter_mut())
    }

    /// Bits per resource unit currently available to `bearer`.
    pub fn efficiency(&self, bearer: BearerId) -> u32 {
        self.terminal(bearer.terminal)
            .map_or(self.channel.worst_case(), |terminal| {
                self.channel.efficiency(terminal.cqi)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{ApplicationProfile, Generator};

    fn bearer(terminal: u32, index: u16) -> Bearer {
        let profile = ApplicationProfile::constant(9, 100.0, 10.0);
        let requirement = profile.requirement().unwrap();
        let generator = Generator::new(&profile, 0, 0).unwrap();
        Bearer::new(
            BearerId::new(terminal, index),
            profile,
            requirement,
            generator,
            1_000,
        )
    }

    fn cell() -> Cell {
        let mut cell = Cell::new(ChannelModel::default());
        for (id, cqi) in [(0, 3), (1, 15)] {
            let mut terminal = Terminal::new(TerminalId(id), cqi);
            terminal.attach(bearer(id, 0));
            terminal.attach(bearer(id, 1));
            cell.add(terminal);
        }
        cell
    }

    #[test]
    fn test_lookup() {
        let cell = cell();
        assert_eq!(
            cell.bearer(BearerId::new(1, 1)).map(|b| b.id()),
            Some(BearerId::new(1, 1))
        );
        assert!(cell.bearer(BearerId::new(1, 2)).is_none());
        assert!(cell.bearer(BearerId::new(2, 0)).is_none());
        let ids: Vec<_> = cell.bearers().map(|b| b.id()).collect();
        assert_eq!(
            ids,
            vec![
                BearerId::new(0, 0),
                BearerId::new(0, 1),
                BearerId::new(1, 0),
                BearerId::new(1, 1),
            ]
        );
    }

    #[test]
    fn test_efficiency_follows_terminal() {
        let mut cell = cell();
        assert_eq!(cell.efficiency(BearerId::new(0, 1)), 54);
        assert_eq!(cell.efficiency(BearerId::new(1, 0)), 800);
        cell.terminals_mut()[0].set_cqi(8);
        assert_eq!(cell.efficiency(BearerId::new(0, 0)), 276);
    }

    #[test]
    #[should_panic(expected = "bearer attached out of order")]
    fn test_attach_out_of_order() {
        let mut terminal = Terminal::new(TerminalId(0), 1);
        terminal.attach(bearer(0, 1));
    }
}
