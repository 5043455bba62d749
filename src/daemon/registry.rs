//! Socket number registry
//!
//! Maps every 16-bit socket number to its lifecycle state. Pure state, no
//! I/O and no locking: only the serializer thread touches it.

use crate::daemon::error::RsktError;

/// Number of socket numbers (0 is never valid)
const SOCKET_SPACE: usize = u16::MAX as usize + 1;

/// First socket number handed out dynamically by default
pub const DEFAULT_DYNAMIC_START: u16 = 0x1000;

/// Lifecycle state of a socket number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketState {
    #[default]
    Uninit,
    Allocated,
    Bound,
    Listening,
    /// Listening with one accept outstanding
    Accepting,
    Connecting,
    Connected,
    Closing,
    ShutDown,
    Closed,
}

impl SocketState {
    /// Free numbers may be bound or allocated again
    pub fn is_free(self) -> bool {
        matches!(self, SocketState::Uninit | SocketState::Closed)
    }
}

/// Socket number state table
pub struct SocketRegistry {
    states: Vec<SocketState>,
    dynamic_start: u16,
    next_dynamic: u16,
}

impl SocketRegistry {
    /// Create a registry whose dynamic range is `dynamic_start..=65535`
    pub fn new(dynamic_start: u16) -> Self {
        let dynamic_start = dynamic_start.max(1);
        Self {
            states: vec![SocketState::Uninit; SOCKET_SPACE],
            dynamic_start,
            next_dynamic: dynamic_start,
        }
    }

    /// Current state of `sn`
    pub fn state(&self, sn: u16) -> SocketState {
        self.states[sn as usize]
    }

    fn check(sn: u16) -> Result<(), RsktError> {
        if sn == 0 {
            return Err(RsktError::InvalidArgument);
        }
        Ok(())
    }

    fn set(&mut self, sn: u16, state: SocketState) {
        self.states[sn as usize] = state;
    }

    /// Claim a specific free socket number
    pub fn allocate(&mut self, sn: u16) -> Result<(), RsktError> {
        Self::check(sn)?;
        if !self.state(sn).is_free() {
            return Err(RsktError::AddressInUse(sn));
        }
        self.set(sn, SocketState::Allocated);
        Ok(())
    }

    /// Claim the next free number of the dynamic range (round robin)
    pub fn allocate_dynamic(&mut self) -> Result<u16, RsktError> {
        let span = u16::MAX as u32 - self.dynamic_start as u32 + 1;
        let mut sn = self.next_dynamic;
        for _ in 0..span {
            let candidate = sn;
            sn = if sn == u16::MAX { self.dynamic_start } else { sn + 1 };
            if self.state(candidate).is_free() {
                self.set(candidate, SocketState::Allocated);
                self.next_dynamic = sn;
                return Ok(candidate);
            }
        }
        Err(RsktError::AddressNotAvailable)
    }

    /// Bind a free socket number
    pub fn bind(&mut self, sn: u16) -> Result<(), RsktError> {
        Self::check(sn)?;
        if !self.state(sn).is_free() {
            return Err(RsktError::AddressInUse(sn));
        }
        self.set(sn, SocketState::Bound);
        Ok(())
    }

    /// Turn a bound socket into a listener
    pub fn listen(&mut self, sn: u16, backlog: u32) -> Result<(), RsktError> {
        Self::check(sn)?;
        if backlog == 0 {
            return Err(RsktError::InvalidArgument);
        }
        match self.state(sn) {
            SocketState::Bound => {
                self.set(sn, SocketState::Listening);
                Ok(())
            }
            SocketState::Listening | SocketState::Accepting => Err(RsktError::AddressInUse(sn)),
            state => Err(RsktError::InvalidState { sn, state }),
        }
    }

    /// Record an outstanding accept; at most one per listener
    pub fn begin_accept(&mut self, sn: u16) -> Result<(), RsktError> {
        Self::check(sn)?;
        if self.state(sn) != SocketState::Listening {
            return Err(RsktError::ConnectionRefused(sn));
        }
        self.set(sn, SocketState::Accepting);
        Ok(())
    }

    /// Mark an allocated socket as connecting
    pub fn begin_connect(&mut self, sn: u16) -> Result<(), RsktError> {
        Self::check(sn)?;
        match self.state(sn) {
            SocketState::Allocated => {
                self.set(sn, SocketState::Connecting);
                Ok(())
            }
            state => Err(RsktError::InvalidState { sn, state }),
        }
    }

    /// Finish an in-progress transition
    pub fn complete(&mut self, sn: u16, state: SocketState) -> Result<(), RsktError> {
        Self::check(sn)?;
        let current = self.state(sn);
        let allowed = matches!(
            (current, state),
            (SocketState::Allocated | SocketState::Connecting, SocketState::Connected)
                | (SocketState::Accepting, SocketState::Listening)
                | (SocketState::Connecting, SocketState::Allocated)
        );
        if !allowed {
            return Err(RsktError::InvalidState { sn, state: current });
        }
        self.set(sn, state);
        Ok(())
    }

    /// Start closing `sn`; returns the state it was in
    ///
    /// The number stays unusable until [`SocketRegistry::release`].
    pub fn close(&mut self, sn: u16) -> Result<SocketState, RsktError> {
        Self::check(sn)?;
        let current = self.state(sn);
        if current.is_free() {
            return Err(RsktError::BadSocket(sn));
        }
        if current != SocketState::ShutDown {
            self.set(sn, SocketState::Closing);
        }
        Ok(current)
    }

    /// Release a closing socket number for reuse
    pub fn release(&mut self, sn: u16) -> Result<(), RsktError> {
        Self::check(sn)?;
        match self.state(sn) {
            SocketState::Closing | SocketState::ShutDown => {
                self.set(sn, SocketState::Closed);
                Ok(())
            }
            state => Err(RsktError::InvalidState { sn, state }),
        }
    }

    /// Close then release in one step, for sockets nobody else references
    pub fn close_and_release(&mut self, sn: u16) -> Result<(), RsktError> {
        self.close(sn)?;
        self.release(sn)
    }

    /// Daemon shutdown: every live number becomes shut-down
    pub fn shutdown_all(&mut self) -> usize {
        let mut count = 0;
        for state in self.states.iter_mut().skip(1) {
            if !state.is_free() {
                *state = SocketState::ShutDown;
                count += 1;
            }
        }
        count
    }

    /// Number of socket numbers currently in use
    pub fn in_use(&self) -> usize {
        self.states.iter().filter(|s| !s.is_free()).count()
    }
}

impl Default for SocketRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_DYNAMIC_START)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_bind_free_states() {
        let mut reg = SocketRegistry::default();
        assert!(reg.bind(10).is_ok());
        assert_eq!(reg.bind(10), Err(RsktError::AddressInUse(10)));

        reg.close_and_release(10).unwrap();
        assert_eq!(reg.state(10), SocketState::Closed);
        assert!(reg.bind(10).is_ok());
    }

    #[test]
    fn test_socket_zero_rejected() {
        let mut reg = SocketRegistry::default();
        assert_eq!(reg.bind(0), Err(RsktError::InvalidArgument));
        assert_eq!(reg.allocate(0), Err(RsktError::InvalidArgument));
    }

    #[test]
    fn test_listen_requires_bound() {
        let mut reg = SocketRegistry::default();
        assert!(matches!(reg.listen(5, 4), Err(RsktError::InvalidState { .. })));
        reg.bind(5).unwrap();
        assert_eq!(reg.listen(5, 0), Err(RsktError::InvalidArgument));
        reg.listen(5, 4).unwrap();
        assert_eq!(reg.listen(5, 4), Err(RsktError::AddressInUse(5)));
    }

    #[test]
    fn test_single_outstanding_accept() {
        let mut reg = SocketRegistry::default();
        reg.bind(5).unwrap();
        reg.listen(5, 1).unwrap();
        reg.begin_accept(5).unwrap();
        assert_eq!(reg.begin_accept(5), Err(RsktError::ConnectionRefused(5)));
        reg.complete(5, SocketState::Listening).unwrap();
        assert!(reg.begin_accept(5).is_ok());
    }

    #[test]
    fn test_dynamic_allocation_wraps() {
        let mut reg = SocketRegistry::new(u16::MAX - 1);
        assert_eq!(reg.allocate_dynamic(), Ok(u16::MAX - 1));
        assert_eq!(reg.allocate_dynamic(), Ok(u16::MAX));
        assert_eq!(reg.allocate_dynamic(), Err(RsktError::AddressNotAvailable));

        reg.close_and_release(u16::MAX - 1).unwrap();
        assert_eq!(reg.allocate_dynamic(), Ok(u16::MAX - 1));
    }

    #[test]
    fn test_connect_lifecycle() {
        let mut reg = SocketRegistry::default();
        let sn = reg.allocate_dynamic().unwrap();
        reg.begin_connect(sn).unwrap();
        reg.complete(sn, SocketState::Connected).unwrap();
        assert_eq!(reg.close(sn), Ok(SocketState::Connected));
        assert_eq!(reg.state(sn), SocketState::Closing);
        // Closing numbers cannot be reused until released
        assert_eq!(reg.bind(sn), Err(RsktError::AddressInUse(sn)));
        reg.release(sn).unwrap();
        assert!(reg.bind(sn).is_ok());
    }

    #[test]
    fn test_shutdown_all() {
        let mut reg = SocketRegistry::default();
        reg.bind(1).unwrap();
        reg.bind(2).unwrap();
        assert_eq!(reg.shutdown_all(), 2);
        assert_eq!(reg.state(1), SocketState::ShutDown);
        reg.release(1).unwrap();
        assert_eq!(reg.in_use(), 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Bind(u16),
        Listen(u16),
        Accept(u16),
        AcceptDone(u16),
        Close(u16),
    }

    fn op() -> impl Strategy<Value = Op> {
        let sn = 1u16..4;
        prop_oneof![
            sn.clone().prop_map(Op::Bind),
            sn.clone().prop_map(Op::Listen),
            sn.clone().prop_map(Op::Accept),
            sn.clone().prop_map(Op::AcceptDone),
            sn.prop_map(Op::Close),
        ]
    }

    proptest! {
        /// Property: a socket number never has two listeners or two accepts.
        #[test]
        fn prop_single_listener_single_accept(ops in prop::collection::vec(op(), 0..64)) {
            let mut reg = SocketRegistry::default();
            // model: (bound, listening, accepting)
            let mut model = [(false, false, false); 4];

            for op in ops {
                match op {
                    Op::Bind(sn) => {
                        let m = &mut model[sn as usize];
                        let ok = reg.bind(sn).is_ok();
                        prop_assert_eq!(ok, !m.0);
                        if ok { m.0 = true; }
                    }
                    Op::Listen(sn) => {
                        let m = &mut model[sn as usize];
                        let ok = reg.listen(sn, 4).is_ok();
                        prop_assert_eq!(ok, m.0 && !m.1);
                        if ok { m.1 = true; }
                    }
                    Op::Accept(sn) => {
                        let m = &mut model[sn as usize];
                        let ok = reg.begin_accept(sn).is_ok();
                        prop_assert_eq!(ok, m.1 && !m.2);
                        if ok { m.2 = true; }
                    }
                    Op::AcceptDone(sn) => {
                        let m = &mut model[sn as usize];
                        let ok = reg.complete(sn, SocketState::Listening).is_ok();
                        prop_assert_eq!(ok, m.2);
                        if ok { m.2 = false; }
                    }
                    Op::Close(sn) => {
                        let m = &mut model[sn as usize];
                        let ok = reg.close_and_release(sn).is_ok();
                        prop_assert_eq!(ok, m.0);
                        if ok { *m = (false, false, false); }
                    }
                }
                for sn in 1..4u16 {
                    let (bound, listening, accepting) = model[sn as usize];
                    let expected = match (bound, listening, accepting) {
                        (false, _, _) => reg.state(sn).is_free(),
                        (true, false, _) => reg.state(sn) == SocketState::Bound,
                        (true, true, false) => reg.state(sn) == SocketState::Listening,
                        (true, true, true) => reg.state(sn) == SocketState::Accepting,
                    };
                    prop_assert!(expected, "sn {} in unexpected state {:?}", sn, reg.state(sn));
                }
            }
        }
    }
}
