//! Stage bodies. Each runs on its own blocking thread and talks to its
//! neighbours only through links.

use log::debug;

use crate::error::StageError;
use crate::format::{Decoder, Demuxer, Encoder, Muxer};
use crate::media::{Frame, Packet, StreamInfo};
use crate::progress::{PipelinePhase, ProgressMeter, ProgressSink};
use crate::transform::Transform;
use super::link::{Interrupt, LinkReceiver, LinkSender};

/// What reaches the muxer: packets of an output stream, or that stream's clean end
pub enum MuxInput {
    Packet(Packet),
    End(usize),
}

pub enum StageFailure {
    /// Stopped because of cancellation or a neighbour going away
    Interrupted(Interrupt),
    Failed(StageError),
}

impl From<Interrupt> for StageFailure {
    fn from(interrupt: Interrupt) -> Self {
        StageFailure::Interrupted(interrupt)
    }
}

/// Where demuxed packets of one source stream go
pub enum Route {
    Decode(LinkSender<Packet>),
    Copy { mux: LinkSender<MuxInput>, output: usize },
}

/// Read the input and fan packets out per stream; returns packets routed
pub fn demux(
    mut demuxer: Box<dyn Demuxer>,
    mut routes: Vec<Option<Route>>,
    progress: &ProgressSink,
) -> Result<u64, StageFailure> {
    progress.advance(PipelinePhase::Demuxing);
    let mut routed = 0u64;
    loop {
        if routes.iter().all(Option::is_none) {
            debug!("{}: no stream accepts packets any more, demux stops early", progress.job());
            break;
        }
        let packet = match demuxer.read_packet() {
            Ok(Some(packet)) => packet,
            Ok(None) => break,
            Err(e) => return Err(StageFailure::Failed(StageError::Demux(e.to_string()))),
        };
        let index = packet.stream_index;
        let Some(slot) = routes.get_mut(index) else { continue };
        let sent = match slot.as_ref() {
            None => continue,
            Some(Route::Decode(tx)) => tx.send(packet),
            Some(Route::Copy { mux, output }) => {
                let mut packet = packet;
                packet.stream_index = *output;
                mux.send(MuxInput::Packet(packet))
            }
        };
        match sent {
            Ok(()) => routed += 1,
            Err(Interrupt::Closed) => {
                debug!("{}: stream {} stopped accepting packets", progress.job(), index);
                *slot = None;
            }
            Err(Interrupt::Cancelled) => return Err(StageFailure::Interrupted(Interrupt::Cancelled)),
        }
    }

    for route in routes.into_iter().flatten() {
        let ended = match route {
            Route::Decode(tx) => tx.finish(),
            Route::Copy { mux, output } => mux.send(MuxInput::End(output)),
        };
        if ended == Err(Interrupt::Cancelled) {
            return Err(StageFailure::Interrupted(Interrupt::Cancelled));
        }
    }
    progress.advance(PipelinePhase::Muxing);
    Ok(routed)
}

fn forward(
    frames: Vec<Frame>,
    transform: &mut Option<Transform>,
    output: &LinkSender<Frame>,
    stream: usize,
    progress: &ProgressSink,
) -> Result<(), StageFailure> {
    for frame in frames {
        progress.advance(PipelinePhase::Transcoding);
        let frames = match transform.as_mut() {
            Some(t) => t.apply(frame).map_err(|e| {
                StageFailure::Failed(StageError::Transform { stream, message: e.to_string() })
            })?,
            None => vec![frame],
        };
        for frame in frames {
            output.send(frame)?;
        }
    }
    Ok(())
}

/// Decode one source stream and apply its transform
pub fn decode(
    stream: usize,
    mut decoder: Box<dyn Decoder>,
    mut transform: Option<Transform>,
    mut input: LinkReceiver<Packet>,
    output: LinkSender<Frame>,
    progress: &ProgressSink,
) -> Result<(), StageFailure> {
    let decode_error = move |e: crate::format::FormatError| {
        StageFailure::Failed(StageError::Decode { stream, message: e.to_string() })
    };
    while let Some(packet) = input.recv()? {
        let frames = decoder.decode(packet).map_err(decode_error)?;
        forward(frames, &mut transform, &output, stream, progress)?;
    }
    let frames = decoder.flush().map_err(decode_error)?;
    forward(frames, &mut transform, &output, stream, progress)?;
    if let Some(t) = transform.as_mut() {
        for frame in t.flush() {
            output.send(frame)?;
        }
    }
    output.finish()?;
    Ok(())
}

/// Encode frames of one stream into packets for output stream `output_index`
pub fn encode(
    stream: usize,
    output_index: usize,
    mut encoder: Box<dyn Encoder>,
    mut input: LinkReceiver<Frame>,
    mux: LinkSender<MuxInput>,
) -> Result<(), StageFailure> {
    let encode_error = move |e: crate::format::FormatError| {
        StageFailure::Failed(StageError::Encode { stream, message: e.to_string() })
    };
    let send_all = |packets: Vec<Packet>| -> Result<(), StageFailure> {
        for mut packet in packets {
            packet.stream_index = output_index;
            mux.send(MuxInput::Packet(packet))?;
        }
        Ok(())
    };
    while let Some(frame) = input.recv()? {
        send_all(encoder.encode(frame).map_err(encode_error)?)?;
    }
    send_all(encoder.flush().map_err(encode_error)?)?;
    mux.send(MuxInput::End(output_index))?;
    Ok(())
}

pub struct MuxSummary {
    /// Output streams that delivered their end-of-stream marker
    pub completed: Vec<bool>,
    pub packets: u64,
    /// Final file size; zero when nothing was finalised
    pub bytes: u64,
}

/// Interleave every output stream into the container; finalises it only when
/// at least one stream finished cleanly
pub fn mux(
    mut muxer: Box<dyn Muxer>,
    mut input: LinkReceiver<MuxInput>,
    targets: &[StreamInfo],
    progress: &ProgressSink,
) -> Result<MuxSummary, StageFailure> {
    let mut meter = ProgressMeter::new(targets.iter().map(|t| t.duration.as_secs_f64()).collect());
    let mut completed = vec![false; targets.len()];
    let mut packets = 0u64;
    loop {
        match input.recv() {
            Ok(Some(MuxInput::Packet(packet))) => {
                let output = packet.stream_index;
                let end = packet.pts + packet.duration;
                muxer
                    .write_packet(packet)
                    .map_err(|e| StageFailure::Failed(StageError::Mux(e.to_string())))?;
                packets += 1;
                if let Some(target) = targets.get(output) {
                    meter.record(output, target.time_base.seconds(end));
                }
                progress.fraction(meter.fraction());
            }
            Ok(Some(MuxInput::End(output))) => {
                debug!("{}: output stream {} complete", progress.job(), output);
                if let Some(done) = completed.get_mut(output) {
                    *done = true;
                }
            }
            // every producer has hung up
            Ok(None) | Err(Interrupt::Closed) => break,
            Err(Interrupt::Cancelled) => return Err(StageFailure::Interrupted(Interrupt::Cancelled)),
        }
    }

    if !completed.contains(&true) {
        return Ok(MuxSummary { completed, packets, bytes: 0 });
    }
    progress.advance(PipelinePhase::Finalizing);
    let bytes = muxer
        .finish()
        .map_err(|e| StageFailure::Failed(StageError::Mux(e.to_string())))?;
    progress.fraction(1.0);
    Ok(MuxSummary { completed, packets, bytes })
}
