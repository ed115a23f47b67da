//! In-memory model of the two-wire bus and the sensor sitting on it.
//!
//! Both lines are wired-AND of a controller half and a peer half. The
//! controller half is driven through [`SdaPin`] and [`SclPin`]; the peer
//! half is a state machine clocked by the edges the controller produces.
//! The peer acknowledges bytes addressed to it, records written frames,
//! and serves canned response bytes keyed by the last written command,
//! so protocol tests run without wall-clock delay.

use std::cell::RefCell;
use std::collections::HashMap;
use std::convert::Infallible;
use std::rc::Rc;

use embedded_hal::digital::v2::{InputPin, OutputPin};

/// Clock-stretch behaviour of the simulated peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stretch {
    /// Clock line never held.
    None,
    /// Clock line held low for the next `n` controller polls.
    Polls(u32),
    /// Clock line held low forever.
    Forever,
}

/// Test handle onto the shared bus state.
pub struct SimBus(Rc<RefCell<Wire>>);

/// Controller half of the data line.
pub struct SdaPin(Rc<RefCell<Wire>>);

/// Controller half of the clock line.
pub struct SclPin(Rc<RefCell<Wire>>);

impl SimBus {
    /// Creates a bus with a peer listening on `address` and returns the
    /// pin handles for the controller side.
    pub fn new(address: u8) -> (SimBus, SdaPin, SclPin) {
        let wire = Rc::new(RefCell::new(Wire {
            sda_controller: true,
            scl_controller: true,
            prev_sda: true,
            prev_scl: true,
            peer: Peer::new(address),
        }));
        (
            SimBus(Rc::clone(&wire)),
            SdaPin(Rc::clone(&wire)),
            SclPin(wire),
        )
    }

    /// Loads the bytes the peer will serve after command `command` has
    /// been written to it.
    pub fn set_response(&self, command: u16, bytes: &[u8]) {
        self.0
            .borrow_mut()
            .peer
            .responses
            .insert(command, bytes.to_vec());
    }

    pub fn set_stretch(&self, stretch: Stretch) {
        self.0.borrow_mut().peer.stretch = stretch;
    }

    /// Makes the peer ignore every address, as if absent from the bus.
    pub fn set_nack_all(&self, nack: bool) {
        self.0.borrow_mut().peer.nack_all = nack;
    }

    /// Data-byte frames the peer has received, one per write access.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.0.borrow().peer.writes.clone()
    }

    /// Acknowledge bits sampled from the controller, one per byte the
    /// peer transmitted (`true` = continue, `false` = final byte).
    pub fn controller_acks(&self) -> Vec<bool> {
        self.0.borrow().peer.controller_acks.clone()
    }

    pub fn sda_level(&self) -> bool {
        self.0.borrow().sda_level()
    }

    pub fn scl_level(&self) -> bool {
        self.0.borrow().scl_level()
    }
}

impl OutputPin for SdaPin {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Infallible> {
        let mut wire = self.0.borrow_mut();
        wire.sda_controller = false;
        wire.step();
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        let mut wire = self.0.borrow_mut();
        wire.sda_controller = true;
        wire.step();
        Ok(())
    }
}

impl InputPin for SdaPin {
    type Error = Infallible;

    fn is_high(&self) -> Result<bool, Infallible> {
        Ok(self.0.borrow().sda_level())
    }

    fn is_low(&self) -> Result<bool, Infallible> {
        Ok(!self.0.borrow().sda_level())
    }
}

impl OutputPin for SclPin {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Infallible> {
        let mut wire = self.0.borrow_mut();
        wire.scl_controller = false;
        wire.step();
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        let mut wire = self.0.borrow_mut();
        wire.scl_controller = true;
        wire.step();
        Ok(())
    }
}

impl InputPin for SclPin {
    type Error = Infallible;

    fn is_high(&self) -> Result<bool, Infallible> {
        Ok(!self.poll_clock())
    }

    fn is_low(&self) -> Result<bool, Infallible> {
        Ok(self.poll_clock())
    }
}

impl SclPin {
    /// One controller poll of the clock line. Counts down a bounded
    /// stretch and reports whether the line still reads low.
    fn poll_clock(&self) -> bool {
        let mut wire = self.0.borrow_mut();
        if let Stretch::Polls(n) = wire.peer.stretch {
            wire.peer.stretch = if n <= 1 { Stretch::None } else { Stretch::Polls(n - 1) };
            wire.step();
        }
        !wire.scl_level()
    }
}

struct Wire {
    sda_controller: bool,
    scl_controller: bool,
    prev_sda: bool,
    prev_scl: bool,
    peer: Peer,
}

impl Wire {
    fn sda_level(&self) -> bool {
        self.sda_controller && self.peer.sda_drive
    }

    fn scl_level(&self) -> bool {
        self.scl_controller && self.peer.scl_drive()
    }

    /// Dispatches the edges produced by the latest line change to the
    /// peer state machine.
    fn step(&mut self) {
        let scl = self.scl_level();
        let sda = self.sda_level();

        if scl != self.prev_scl {
            if scl {
                self.peer.on_scl_rising(sda);
            } else {
                self.peer.on_scl_falling();
            }
        } else if sda != self.prev_sda && scl && self.prev_scl {
            // Data moved while the clock stayed high.
            if sda {
                self.peer.on_stop();
            } else {
                self.peer.on_start();
            }
        }

        self.prev_scl = scl;
        // The peer may have moved the data line in an edge handler.
        self.prev_sda = self.sda_level();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for a start condition.
    Idle,
    /// Shifting a byte in, `bits` sampled so far.
    Receive { bits: u8 },
    /// Byte complete; pull the data line low on the next falling edge.
    AckPending,
    /// Acknowledge held low; released at the end of the ninth clock.
    AckHeld,
    /// Shifting a byte out, `placed` bits already on the line.
    Transmit { placed: u8 },
    /// Byte sent; sample the controller's acknowledge on the next rising
    /// edge.
    AwaitAck,
    /// Not addressed or done; ignore everything until a start or stop.
    Halted,
}

struct Peer {
    address: u8,
    nack_all: bool,
    stretch: Stretch,
    sda_drive: bool,
    phase: Phase,
    shift: u8,
    expecting_address: bool,
    direction_read: bool,
    last_ack: bool,
    tx: Vec<u8>,
    tx_index: usize,
    tx_byte: u8,
    current_frame: Vec<u8>,
    writes: Vec<Vec<u8>>,
    responses: HashMap<u16, Vec<u8>>,
    controller_acks: Vec<bool>,
}

impl Peer {
    fn new(address: u8) -> Self {
        Self {
            address,
            nack_all: false,
            stretch: Stretch::None,
            sda_drive: true,
            phase: Phase::Idle,
            shift: 0,
            expecting_address: false,
            direction_read: false,
            last_ack: false,
            tx: Vec::new(),
            tx_index: 0,
            tx_byte: 0,
            current_frame: Vec::new(),
            writes: Vec::new(),
            responses: HashMap::new(),
            controller_acks: Vec::new(),
        }
    }

    fn scl_drive(&self) -> bool {
        matches!(self.stretch, Stretch::None)
    }

    fn on_start(&mut self) {
        self.flush_frame();
        self.sda_drive = true;
        self.shift = 0;
        self.expecting_address = true;
        self.phase = Phase::Receive { bits: 0 };
    }

    fn on_stop(&mut self) {
        self.flush_frame();
        self.sda_drive = true;
        self.expecting_address = false;
        self.phase = Phase::Idle;
    }

    fn on_scl_rising(&mut self, sda: bool) {
        match self.phase {
            Phase::Receive { bits } => {
                self.shift = (self.shift << 1) | u8::from(sda);
                if bits == 7 {
                    self.byte_received();
                } else {
                    self.phase = Phase::Receive { bits: bits + 1 };
                }
            }
            Phase::AwaitAck => {
                self.last_ack = !sda;
                self.controller_acks.push(self.last_ack);
            }
            _ => {}
        }
    }

    fn on_scl_falling(&mut self) {
        match self.phase {
            Phase::AckPending => {
                self.sda_drive = false;
                self.phase = Phase::AckHeld;
            }
            Phase::AckHeld => {
                // End of the ninth clock.
                if self.direction_read {
                    self.load_tx_byte();
                } else {
                    self.sda_drive = true;
                    self.shift = 0;
                    self.phase = Phase::Receive { bits: 0 };
                }
            }
            Phase::Transmit { placed } => {
                if placed == 8 {
                    self.sda_drive = true;
                    self.phase = Phase::AwaitAck;
                } else {
                    self.sda_drive = self.tx_byte & (0x80 >> placed) != 0;
                    self.phase = Phase::Transmit { placed: placed + 1 };
                }
            }
            Phase::AwaitAck => {
                if self.last_ack {
                    self.load_tx_byte();
                } else {
                    self.sda_drive = true;
                    self.phase = Phase::Halted;
                }
            }
            _ => {}
        }
    }

    fn byte_received(&mut self) {
        let byte = self.shift;
        if self.expecting_address {
            if self.nack_all || byte >> 1 != self.address {
                self.phase = Phase::Halted;
                return;
            }
            self.expecting_address = false;
            self.direction_read = byte & 1 != 0;
            if self.direction_read {
                let command = self.last_command();
                self.tx = self.responses.get(&command).cloned().unwrap_or_default();
                self.tx_index = 0;
            }
        } else {
            self.current_frame.push(byte);
        }
        self.phase = Phase::AckPending;
    }

    /// Place the most significant bit of the next response byte on the
    /// line; called on the falling edge that ends an acknowledge clock.
    fn load_tx_byte(&mut self) {
        // Serve 0xFF once the canned response runs dry.
        self.tx_byte = self.tx.get(self.tx_index).copied().unwrap_or(0xFF);
        self.tx_index += 1;
        self.sda_drive = self.tx_byte & 0x80 != 0;
        self.phase = Phase::Transmit { placed: 1 };
    }

    fn flush_frame(&mut self) {
        if !self.current_frame.is_empty() {
            self.writes.push(core::mem::take(&mut self.current_frame));
        }
    }

    /// The opcode of the most recent completed write frame.
    fn last_command(&self) -> u16 {
        match self.writes.last() {
            Some(frame) if frame.len() >= 2 => u16::from_be_bytes([frame[0], frame[1]]),
            _ => 0xFFFF,
        }
    }
}
