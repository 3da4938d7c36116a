//! BDX sender state machine.
//!
//! This module provides a pure, side-effect-free state machine for one bulk
//! transfer from the device to a collector. It takes events as input and
//! produces a new state plus a list of actions to execute.
//!
//! Filling blocks and sending messages is done by the offload client in
//! wdm-client, not by this module.
//!
//! ```text
//! Idle ─Start─▶ AwaitingAccept ─Accepted─▶ Transferring ◀─BlockReady(last=false)─┐
//!                                              │ BlockQueried                    │
//!                                              ▼                                 │
//!                                           Filling ─────────────────────────────┘
//!                                              │ BlockReady(last=true)
//!                                              ▼
//!                                        AwaitingEofAck ─EofAcked─▶ Idle
//! ```

use std::fmt;

use wdm_types::{
    status, Block, BlockEof, Message, SendInit, StatusReport, TransferError,
};

/// Transfer state machine - NO I/O, just state transitions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TransferState {
    /// No transfer.
    #[default]
    Idle,
    /// SendInit sent, waiting for the collector.
    AwaitingAccept {
        /// Largest block we offered.
        max_block_size: u32,
    },
    /// Accepted, waiting for the next BlockQuery.
    Transferring {
        /// Negotiated block size.
        max_block_size: u32,
        /// Counter the next BlockQuery must carry.
        next_counter: u32,
    },
    /// A block was requested and is being filled.
    Filling {
        /// Negotiated block size.
        max_block_size: u32,
        /// Counter of the requested block.
        block_counter: u32,
    },
    /// Final block sent, waiting for the acknowledgement.
    AwaitingEofAck {
        /// Counter of the final block.
        block_counter: u32,
    },
}

impl TransferState {
    /// Create a state machine in the Idle state.
    pub fn new() -> Self {
        Self::Idle
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// Events that make no sense in the current state leave it unchanged.
    pub fn on_event(self, event: TransferEvent) -> (Self, Vec<TransferAction>) {
        match (self, event) {
            // From Idle
            (
                Self::Idle,
                TransferEvent::Start {
                    file_designator,
                    max_block_size,
                },
            ) => (
                Self::AwaitingAccept { max_block_size },
                vec![TransferAction::Send(Message::SendInit(SendInit {
                    file_designator,
                    max_block_size,
                }))],
            ),

            // From AwaitingAccept
            (
                Self::AwaitingAccept { max_block_size },
                TransferEvent::Accepted {
                    max_block_size: offered,
                },
            ) => {
                let negotiated = if offered == 0 {
                    max_block_size
                } else {
                    offered.min(max_block_size)
                };
                (
                    Self::Transferring {
                        max_block_size: negotiated,
                        next_counter: 0,
                    },
                    vec![],
                )
            }
            (Self::AwaitingAccept { .. }, TransferEvent::Rejected { status }) => (
                Self::Idle,
                vec![TransferAction::Failed {
                    reason: FailureReason::Rejected,
                    status: Some(status),
                }],
            ),

            // From Transferring
            (
                Self::Transferring {
                    max_block_size,
                    next_counter,
                },
                TransferEvent::BlockQueried { block_counter },
            ) if block_counter == next_counter => (
                Self::Filling {
                    max_block_size,
                    block_counter,
                },
                vec![TransferAction::FillBlock {
                    block_counter,
                    max_size: max_block_size as usize,
                }],
            ),
            (Self::Transferring { .. }, TransferEvent::BlockQueried { .. }) => bad_counter(),

            // From Filling
            (
                Self::Filling {
                    max_block_size,
                    block_counter,
                },
                TransferEvent::BlockReady { data, last: false },
            ) => (
                Self::Transferring {
                    max_block_size,
                    next_counter: block_counter.wrapping_add(1),
                },
                vec![TransferAction::Send(Message::Block(Block {
                    block_counter,
                    data,
                }))],
            ),
            (Self::Filling { block_counter, .. }, TransferEvent::BlockReady { data, last: true }) => (
                Self::AwaitingEofAck { block_counter },
                vec![TransferAction::Send(Message::BlockEof(BlockEof {
                    block_counter,
                    data,
                }))],
            ),

            // From AwaitingEofAck
            (
                Self::AwaitingEofAck { block_counter },
                TransferEvent::EofAcked {
                    block_counter: acked,
                },
            ) if acked == block_counter => (Self::Idle, vec![TransferAction::Finished]),
            (Self::AwaitingEofAck { .. }, TransferEvent::EofAcked { .. }) => bad_counter(),

            // From any active state
            (state, TransferEvent::PeerError { status }) if state.is_active() => (
                Self::Idle,
                vec![TransferAction::Failed {
                    reason: FailureReason::PeerError,
                    status: Some(status),
                }],
            ),
            (state, TransferEvent::TransportFailed { reason }) if state.is_active() => (
                Self::Idle,
                vec![TransferAction::Failed {
                    reason: FailureReason::TransportFailure(reason),
                    status: None,
                }],
            ),
            (state, TransferEvent::TimedOut) if state.is_active() => (
                Self::Idle,
                vec![TransferAction::Failed {
                    reason: FailureReason::Timeout,
                    status: None,
                }],
            ),
            (state, TransferEvent::StorageFailed { reason }) if state.is_active() => (
                Self::Idle,
                vec![
                    TransferAction::Send(Message::TransferError(TransferError {
                        status: StatusReport::new(
                            status::PROFILE_BDX,
                            status::BDX_TRANSFER_FAILED,
                        ),
                    })),
                    TransferAction::Failed {
                        reason: FailureReason::Storage(reason),
                        status: None,
                    },
                ],
            ),
            (state, TransferEvent::Abort) if state.is_active() => (
                Self::Idle,
                vec![
                    TransferAction::Send(Message::TransferError(TransferError {
                        status: StatusReport::new(
                            status::PROFILE_BDX,
                            status::BDX_TRANSFER_ABORTED,
                        ),
                    })),
                    TransferAction::Failed {
                        reason: FailureReason::Aborted,
                        status: None,
                    },
                ],
            ),

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Check if a transfer is under way.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Idle)
    }

    /// Check if a block is being filled.
    pub fn is_filling(&self) -> bool {
        matches!(self, Self::Filling { .. })
    }
}

fn bad_counter() -> (TransferState, Vec<TransferAction>) {
    (
        TransferState::Idle,
        vec![
            TransferAction::Send(Message::TransferError(TransferError {
                status: StatusReport::new(status::PROFILE_BDX, status::BDX_BAD_BLOCK_COUNTER),
            })),
            TransferAction::Failed {
                reason: FailureReason::BadBlockCounter,
                status: None,
            },
        ],
    )
}

/// Events that can occur during a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// Start a transfer.
    Start {
        /// Name of the uploaded file on the collector.
        file_designator: String,
        /// Largest block we are willing to send.
        max_block_size: u32,
    },
    /// Collector accepted the transfer.
    Accepted {
        /// Largest block the collector accepts.
        max_block_size: u32,
    },
    /// Collector refused the transfer.
    Rejected {
        /// Reason given by the collector.
        status: StatusReport,
    },
    /// Collector asked for a block.
    BlockQueried {
        /// Counter of the requested block.
        block_counter: u32,
    },
    /// The requested block was filled.
    BlockReady {
        /// Block contents.
        data: Vec<u8>,
        /// No data remains after this block.
        last: bool,
    },
    /// Collector acknowledged the final block.
    EofAcked {
        /// Counter of the acknowledged block.
        block_counter: u32,
    },
    /// Collector ended the transfer with an error.
    PeerError {
        /// Reason given by the collector.
        status: StatusReport,
    },
    /// The transport failed.
    TransportFailed {
        /// Error message describing the failure.
        reason: String,
    },
    /// Collector did not answer in time.
    TimedOut,
    /// A block could not be read from the log.
    StorageFailed {
        /// Error message describing the failure.
        reason: String,
    },
    /// Local abort.
    Abort,
}

/// Actions to be executed by the offload client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferAction {
    /// Send a message on the transfer exchange.
    Send(Message),
    /// Fill block `block_counter` with at most `max_size` bytes and report
    /// back with [`TransferEvent::BlockReady`].
    FillBlock {
        /// Counter of the block to fill.
        block_counter: u32,
        /// Byte budget of the block.
        max_size: usize,
    },
    /// The collector has everything.
    Finished,
    /// The transfer failed.
    Failed {
        /// What went wrong.
        reason: FailureReason,
        /// Status reported by the collector, if any.
        status: Option<StatusReport>,
    },
}

/// Why a transfer failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Collector refused the transfer.
    Rejected,
    /// Collector ended the transfer with an error.
    PeerError,
    /// Collector sent an out-of-sequence block counter.
    BadBlockCounter,
    /// The transport failed.
    TransportFailure(String),
    /// The log could not supply a block.
    Storage(String),
    /// Aborted locally.
    Aborted,
    /// Collector did not answer in time.
    Timeout,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Rejected => f.write_str("rejected"),
            FailureReason::PeerError => f.write_str("peer error"),
            FailureReason::BadBlockCounter => f.write_str("bad block counter"),
            FailureReason::TransportFailure(reason) => write!(f, "transport failure: {reason}"),
            FailureReason::Storage(reason) => write!(f, "storage failure: {reason}"),
            FailureReason::Aborted => f.write_str("aborted"),
            FailureReason::Timeout => f.write_str("timeout"),
        }
    }
}
