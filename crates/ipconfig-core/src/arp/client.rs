//! Per-operation ARP client state
//!
//! A client runs one operation at a time. Its retry state advances on timer
//! expiry through [`ArpClient::next_step`]; incoming frames are tested with
//! [`ArpClient::match_frame`].

use super::ArpAddress;
use super::frame::ArpFrame;
use crate::config::ArpSettings;
use crate::interface::HwAddr;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Operation a client is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArpCommand {
    Idle,
    Probe,
    Resolve,
    Detect,
    Announce,
}

/// Retransmission cadence of a detect operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectCadence {
    /// Fast cycles (`detect_interval`)
    Detect,
    /// Resolve pacing (`resolve_interval`)
    Resolve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Sending probes
    Probing,
    /// Waiting out a probe collision before re-probing
    ConflictWait,
    /// Sending gratuitous announcements
    Announcing,
    /// Sending requests (resolve, detect)
    Requesting,
    /// Result found in the current batch, completion pending
    Reported,
    /// No operation
    Done,
}

/// Frame to put on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outgoing {
    Probe {
        sender_ip: Ipv4Addr,
        target_ip: Ipv4Addr,
    },
    Announcement {
        ip: Ipv4Addr,
    },
    Request {
        sender_ip: Ipv4Addr,
        target_ip: Ipv4Addr,
        unicast: Option<HwAddr>,
    },
}

/// What a timer expiry (or the operation start) leads to
#[derive(Debug)]
pub(crate) enum Step {
    Send {
        frames: Vec<Outgoing>,
        wait: Duration,
    },
    Finish,
    Nothing,
}

/// Result of testing one frame against a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameMatch {
    None,
    InUse(ArpAddress),
    /// Another host is probing for the same address
    Collision,
}

#[derive(Debug)]
pub(crate) struct ArpClient<T> {
    pub ifname: String,
    pub command: ArpCommand,
    pub phase: Phase,
    pub sender_ip: Ipv4Addr,
    pub target_ip: Ipv4Addr,
    pub candidates: Vec<ArpAddress>,
    pub cadence: DetectCadence,
    pub tries: u32,
    /// Request budget for resolve
    pub limit: u32,
    pub conflicts: u32,
    pub tag: Option<T>,
    pub holds_handle: bool,
    pub error_message: Option<String>,
    pub sequence: u64,
}

impl<T> ArpClient<T> {
    pub fn new(ifname: String) -> Self {
        Self {
            ifname,
            command: ArpCommand::Idle,
            phase: Phase::Done,
            sender_ip: Ipv4Addr::UNSPECIFIED,
            target_ip: Ipv4Addr::UNSPECIFIED,
            candidates: Vec::new(),
            cadence: DetectCadence::Detect,
            tries: 0,
            limit: 0,
            conflicts: 0,
            tag: None,
            holds_handle: false,
            error_message: None,
            sequence: 0,
        }
    }

    /// Prepare for a new operation
    pub fn reset(&mut self, command: ArpCommand, tag: T, sequence: u64) {
        self.command = command;
        self.phase = match command {
            ArpCommand::Probe => Phase::Probing,
            ArpCommand::Announce => Phase::Announcing,
            ArpCommand::Resolve | ArpCommand::Detect => Phase::Requesting,
            ArpCommand::Idle => Phase::Done,
        };
        self.candidates.clear();
        self.tries = 0;
        self.limit = 0;
        self.conflicts = 0;
        self.tag = Some(tag);
        self.error_message = None;
        self.sequence = sequence;
    }

    /// Whether frames should still be tested against this client
    pub fn is_active(&self) -> bool {
        self.command != ArpCommand::Idle && !matches!(self.phase, Phase::Reported | Phase::Done)
    }

    pub fn address(&self) -> ArpAddress {
        ArpAddress {
            sender_ip: self.sender_ip,
            target_ip: self.target_ip,
            target_hw: None,
        }
    }

    /// Advance the retry state machine by one step
    pub fn next_step(&mut self, settings: &ArpSettings) -> Step {
        loop {
            match (self.command, self.phase) {
                (ArpCommand::Probe, Phase::ConflictWait) => {
                    self.phase = Phase::Probing;
                    self.tries = 0;
                }
                (ArpCommand::Probe, Phase::Probing) => {
                    if self.tries < settings.probe_count {
                        self.tries += 1;
                        return Step::Send {
                            frames: vec![Outgoing::Probe {
                                sender_ip: self.sender_ip,
                                target_ip: self.target_ip,
                            }],
                            wait: settings.probe_interval(),
                        };
                    }
                    self.phase = Phase::Announcing;
                }
                (ArpCommand::Probe, Phase::Announcing) => {
                    let total = settings.probe_count + settings.gratuitous_count;
                    if self.tries < total {
                        self.tries += 1;
                        return self.announcement(settings);
                    }
                    return Step::Finish;
                }
                (ArpCommand::Announce, Phase::Announcing) => {
                    if self.tries < settings.gratuitous_count {
                        self.tries += 1;
                        return self.announcement(settings);
                    }
                    return Step::Finish;
                }
                (ArpCommand::Resolve, Phase::Requesting) => {
                    if self.tries < self.limit {
                        self.tries += 1;
                        return Step::Send {
                            frames: vec![Outgoing::Request {
                                sender_ip: self.sender_ip,
                                target_ip: self.target_ip,
                                unicast: None,
                            }],
                            wait: settings.resolve_interval(),
                        };
                    }
                    return Step::Finish;
                }
                (ArpCommand::Detect, Phase::Requesting) => {
                    if self.tries < settings.detect_count {
                        self.tries += 1;
                        let frames = self
                            .candidates
                            .iter()
                            .map(|c| Outgoing::Request {
                                sender_ip: c.sender_ip,
                                target_ip: c.target_ip,
                                unicast: c.target_hw,
                            })
                            .collect();
                        let wait = match self.cadence {
                            DetectCadence::Detect => settings.detect_interval(),
                            DetectCadence::Resolve => settings.resolve_interval(),
                        };
                        return Step::Send { frames, wait };
                    }
                    return Step::Finish;
                }
                _ => return Step::Nothing,
            }
        }
    }

    fn announcement(&self, settings: &ArpSettings) -> Step {
        Step::Send {
            frames: vec![Outgoing::Announcement { ip: self.target_ip }],
            wait: settings.gratuitous_interval(),
        }
    }

    /// Test a frame against this client's match rule
    ///
    /// Frames from the host's own interfaces are filtered out by the caller.
    pub fn match_frame(&self, frame: &ArpFrame) -> FrameMatch {
        if !self.is_active() {
            return FrameMatch::None;
        }
        let found = ArpAddress {
            sender_ip: self.sender_ip,
            target_ip: self.target_ip,
            target_hw: Some(frame.sender_hw),
        };
        match self.command {
            ArpCommand::Probe => {
                if frame.sender_ip == self.target_ip {
                    FrameMatch::InUse(found)
                } else if self.phase != Phase::Announcing
                    && frame.is_probe()
                    && frame.target_ip == self.target_ip
                {
                    FrameMatch::Collision
                } else {
                    FrameMatch::None
                }
            }
            ArpCommand::Announce | ArpCommand::Resolve => {
                if frame.sender_ip == self.target_ip {
                    FrameMatch::InUse(found)
                } else {
                    FrameMatch::None
                }
            }
            ArpCommand::Detect => self
                .candidates
                .iter()
                .find(|c| c.target_ip == frame.sender_ip && c.target_hw == Some(frame.sender_hw))
                .map_or(FrameMatch::None, |c| FrameMatch::InUse(*c)),
            ArpCommand::Idle => FrameMatch::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arp::frame::ArpOp;

    fn frame(op: ArpOp, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> ArpFrame {
        ArpFrame {
            op,
            sender_hw: HwAddr::ethernet([0x02, 0, 0, 0, 0, 0x99]),
            sender_ip,
            target_hw: None,
            target_ip,
        }
    }

    fn probing_client() -> ArpClient<()> {
        let mut client = ArpClient::new("en0".into());
        client.reset(ArpCommand::Probe, (), 1);
        client.target_ip = Ipv4Addr::new(169, 254, 1, 1);
        client
    }

    #[test]
    fn test_probe_step_sequence() {
        let settings = ArpSettings::default();
        let mut client = probing_client();
        let mut sent = Vec::new();
        loop {
            match client.next_step(&settings) {
                Step::Send { frames, .. } => sent.extend(frames),
                Step::Finish => break,
                Step::Nothing => panic!("probe stalled"),
            }
        }
        assert_eq!(sent.len(), 5);
        assert!(matches!(sent[0], Outgoing::Probe { .. }));
        assert!(matches!(sent[2], Outgoing::Probe { .. }));
        assert!(matches!(sent[3], Outgoing::Announcement { .. }));
        assert!(matches!(sent[4], Outgoing::Announcement { .. }));
    }

    #[test]
    fn test_probe_collision_ignored_while_announcing() {
        let mut client = probing_client();
        let collision = frame(
            ArpOp::Request,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::new(169, 254, 1, 1),
        );
        assert_eq!(client.match_frame(&collision), FrameMatch::Collision);

        client.phase = Phase::Announcing;
        assert_eq!(client.match_frame(&collision), FrameMatch::None);

        let owner = frame(
            ArpOp::Reply,
            Ipv4Addr::new(169, 254, 1, 1),
            Ipv4Addr::UNSPECIFIED,
        );
        assert!(matches!(client.match_frame(&owner), FrameMatch::InUse(_)));
    }

    #[test]
    fn test_detect_requires_full_triple() {
        let mut client: ArpClient<()> = ArpClient::new("en0".into());
        client.reset(ArpCommand::Detect, (), 1);
        client.candidates.push(ArpAddress {
            sender_ip: Ipv4Addr::new(10, 0, 0, 5),
            target_ip: Ipv4Addr::new(10, 0, 0, 1),
            target_hw: Some(HwAddr::ethernet([0x02, 0, 0, 0, 0, 0x01])),
        });
        // Right IP, wrong hardware address
        let reply = frame(ArpOp::Reply, Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(client.match_frame(&reply), FrameMatch::None);

        let mut right = reply;
        right.sender_hw = HwAddr::ethernet([0x02, 0, 0, 0, 0, 0x01]);
        assert!(matches!(client.match_frame(&right), FrameMatch::InUse(_)));
    }
}
