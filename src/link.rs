use anyhow::{Context, Result};
use serialport::SerialPort;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::BoardConfig;
use crate::element::Element;
use crate::protocol::tactile;
use crate::protocol::FrameSink;

/// Connection to one tactile board.
///
/// Operations are synchronous: each one writes directly to the sink and
/// flushes before returning. While the link is disconnected every operation
/// is a silent no-op; callers that retry opportunistically rely on this, so
/// a missing sink is not an error. The protocol assumes exclusive, ordered
/// access to the sink; there is no internal locking.
pub struct BoardLink<S: FrameSink = Box<dyn SerialPort>> {
    config: BoardConfig,
    sink: Option<S>,
    frames_sent: Arc<AtomicU64>,
    ddebug: bool,
}

impl BoardLink<Box<dyn SerialPort>> {
    /// Open the serial port for a board and apply its configured
    /// amp-modulation step.
    pub fn open(config: BoardConfig, debug: bool, ddebug: bool) -> Result<Self> {
        if config.firmware != "tactile" {
            anyhow::bail!(
                "Unknown firmware family '{}' on {}",
                config.firmware,
                config.port
            );
        }

        let port = open_port(&config)?;
        let mut link = BoardLink {
            config,
            sink: Some(port),
            frames_sent: Arc::new(AtomicU64::new(0)),
            ddebug,
        };

        if let Some(step) = link.config.amp_mod_step {
            link.set_amp_modulation_step(step)?;
        }

        if debug {
            println!(
                "✓ Opened {} (origin {}, {} baud, {} elements)",
                link.config.port,
                link.config.origin,
                link.config.baud_rate,
                tactile::ELEMENT_COUNT
            );
        }

        Ok(link)
    }
}

impl<S: FrameSink> BoardLink<S> {
    /// Build a link over an arbitrary sink, for exercising the protocol
    /// without hardware.
    #[cfg(test)]
    fn with_sink(config: BoardConfig, sink: S) -> Self {
        BoardLink {
            config,
            sink: Some(sink),
            frames_sent: Arc::new(AtomicU64::new(0)),
            ddebug: false,
        }
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.sink.is_some()
    }

    /// Drop the sink. Subsequent operations become no-ops until the link is
    /// reopened.
    pub fn disconnect(&mut self) {
        self.sink = None;
    }

    /// Get a clone of the frames sent counter (for statistics)
    pub fn frames_sent_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.frames_sent)
    }

    /// Encode a pattern and write it to the staging buffers on the board.
    ///
    /// The phase frame is always written; the amplitude frame only when some
    /// element modulates below full scale. One flush after the frame
    /// sequence. Nothing is visible on the array until `switch_buffers`.
    pub fn send_pattern(&mut self, elements: &[Element]) -> Result<()> {
        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };

        let frames = tactile::build_pattern_frames(elements, self.config.origin);

        if self.ddebug {
            let hex: String = frames
                .phases
                .iter()
                .take(30)
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(" ");
            eprintln!(
                "[DEBUG {}] Phase frame ({} bytes, amplitude frame: {}): {} ...",
                self.config.port,
                frames.phases.len(),
                frames.amplitudes.is_some(),
                hex
            );
        }

        sink.write_frame(&frames.phases)
            .with_context(|| format!("Failed to write phase frame to {}", self.config.port))?;
        if let Some(amplitudes) = &frames.amplitudes {
            sink.write_frame(amplitudes).with_context(|| {
                format!("Failed to write amplitude frame to {}", self.config.port)
            })?;
        }
        sink.flush()
            .with_context(|| format!("Failed to flush {}", self.config.port))?;

        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Commit the staged frames: the firmware promotes them atomically to
    /// the active buffer, so the array never shows a half-written pattern.
    pub fn switch_buffers(&mut self) -> Result<()> {
        self.send_command(tactile::CMD_SWAP_BUFFERS)
    }

    /// Set the firmware's amplitude-modulation step rate. Steps outside
    /// 0-31 are truncated into range.
    pub fn set_amp_modulation_step(&mut self, step: u8) -> Result<()> {
        self.send_command(tactile::amp_mod_step_command(step))
    }

    /// Flip the board's quick-multiplex output mode. The firmware keeps the
    /// mode; this side tracks nothing.
    pub fn toggle_quick_multiplex(&mut self) -> Result<()> {
        self.send_command(tactile::CMD_MULTIPLEX_TOGGLE)
    }

    /// Stage an all-off pattern and commit it, turning every element off.
    pub fn silence(&mut self) -> Result<()> {
        let origin = self.config.origin;
        let off: Vec<Element> = (0..tactile::ELEMENT_COUNT)
            .map(|slot| Element {
                index: origin + slot,
                phase: 0.0,
                amplitude: 0.0,
                peak_amplitude: 0.0,
            })
            .collect();

        self.send_pattern(&off)?;
        self.switch_buffers()
    }

    fn send_command(&mut self, command: u8) -> Result<()> {
        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };

        sink.write_byte(command)
            .with_context(|| format!("Failed to write command to {}", self.config.port))?;
        sink.flush()
            .with_context(|| format!("Failed to flush {}", self.config.port))?;
        Ok(())
    }
}

/// Open a board's serial port: 8N1, no flow control, 1s write timeout.
fn open_port(config: &BoardConfig) -> Result<Box<dyn SerialPort>> {
    let mut port = serialport::new(&config.port, config.baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .open()
        .context(format!("Failed to open serial port {}", config.port))?;

    // Avoid blocking forever on a wedged port
    port.set_timeout(Duration::from_millis(1000))
        .context("Failed to set serial port timeout")?;

    if let Err(e) = port.write_data_terminal_ready(true) {
        eprintln!("Warning: Failed to set DTR on {}: {}", config.port, e);
    }

    // Allow the FPGA's serial bridge to initialize
    thread::sleep(Duration::from_millis(100));

    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::tactile::{
        CMD_MULTIPLEX_TOGGLE, CMD_START_AMPLITUDES, CMD_START_PHASES, CMD_SWAP_BUFFERS,
        ELEMENT_COUNT, PHASE_OFF,
    };
    use std::io;

    /// Captures writes and flush calls without any transport.
    #[derive(Default)]
    struct Recorder {
        bytes: Vec<u8>,
        flushes: usize,
    }

    impl FrameSink for Recorder {
        fn write_byte(&mut self, byte: u8) -> io::Result<()> {
            self.bytes.push(byte);
            Ok(())
        }

        fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
            self.bytes.extend_from_slice(frame);
            Ok(())
        }

        fn flush(&mut self) -> io::Result<()> {
            self.flushes += 1;
            Ok(())
        }
    }

    fn test_config() -> BoardConfig {
        BoardConfig {
            port: "mock".to_string(),
            baud_rate: tactile::PREFERRED_BAUD_RATE,
            origin: 0,
            firmware: "tactile".to_string(),
            amp_mod_step: None,
        }
    }

    fn test_link() -> BoardLink<Recorder> {
        BoardLink::with_sink(test_config(), Recorder::default())
    }

    fn element(index: usize, phase: f32, amplitude: f32, peak: f32) -> Element {
        Element {
            index,
            phase,
            amplitude,
            peak_amplitude: peak,
        }
    }

    fn sink(link: &BoardLink<Recorder>) -> &Recorder {
        link.sink.as_ref().unwrap()
    }

    #[test]
    fn test_send_pattern_full_amplitude_writes_phase_frame_only() {
        let mut link = test_link();
        link.send_pattern(&[element(0, 0.5, 1.0, 1.0)]).unwrap();

        let recorder = sink(&link);
        assert_eq!(recorder.bytes.len(), ELEMENT_COUNT + 1);
        assert_eq!(recorder.bytes[0], CMD_START_PHASES);
        assert_eq!(recorder.bytes[1], 8);
        assert_eq!(recorder.flushes, 1);
    }

    #[test]
    fn test_send_pattern_modulating_writes_both_frames() {
        let mut link = test_link();
        link.send_pattern(&[element(0, 0.0, 0.5, 1.0)]).unwrap();

        let recorder = sink(&link);
        assert_eq!(recorder.bytes.len(), 2 * (ELEMENT_COUNT + 1));
        assert_eq!(recorder.bytes[0], CMD_START_PHASES);
        assert_eq!(recorder.bytes[ELEMENT_COUNT + 1], CMD_START_AMPLITUDES);
        assert_eq!(recorder.bytes[ELEMENT_COUNT + 2], 8);
        // Both frames go out before the single flush
        assert_eq!(recorder.flushes, 1);
    }

    #[test]
    fn test_switch_buffers_is_independent_of_frame_state() {
        // No prior send_pattern: still exactly one byte and one flush
        let mut link = test_link();
        link.switch_buffers().unwrap();

        let recorder = sink(&link);
        assert_eq!(recorder.bytes, vec![CMD_SWAP_BUFFERS]);
        assert_eq!(recorder.flushes, 1);
    }

    #[test]
    fn test_set_amp_modulation_step_truncates() {
        let mut link = test_link();
        link.set_amp_modulation_step(40).unwrap();
        assert_eq!(sink(&link).bytes, vec![0xA8]);
    }

    #[test]
    fn test_toggle_quick_multiplex_is_stateless() {
        let mut link = test_link();
        link.toggle_quick_multiplex().unwrap();
        link.toggle_quick_multiplex().unwrap();

        let recorder = sink(&link);
        assert_eq!(
            recorder.bytes,
            vec![CMD_MULTIPLEX_TOGGLE, CMD_MULTIPLEX_TOGGLE]
        );
        assert_eq!(recorder.flushes, 2);
    }

    #[test]
    fn test_disconnected_link_operations_are_silent_noops() {
        let mut link = test_link();
        link.disconnect();

        assert!(link.send_pattern(&[element(0, 0.5, 0.5, 1.0)]).is_ok());
        assert!(link.switch_buffers().is_ok());
        assert!(link.set_amp_modulation_step(8).is_ok());
        assert!(link.toggle_quick_multiplex().is_ok());
        assert!(!link.is_connected());
    }

    #[test]
    fn test_origin_filters_elements_for_this_board() {
        let mut config = test_config();
        config.origin = 256;
        let mut link = BoardLink::with_sink(config, Recorder::default());

        // First board's element is ignored, second board's lands in slot 4
        link.send_pattern(&[element(0, 0.5, 1.0, 1.0), element(260, 0.5, 1.0, 1.0)])
            .unwrap();

        let recorder = sink(&link);
        assert_eq!(recorder.bytes[5], 8);
        assert!(recorder.bytes[1..5].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_silence_stages_phase_off_frame_and_commits() {
        let mut link = test_link();
        link.silence().unwrap();

        let recorder = sink(&link);
        // Phase frame with every slot at the sentinel, then the swap byte
        assert_eq!(recorder.bytes.len(), ELEMENT_COUNT + 2);
        assert_eq!(recorder.bytes[0], CMD_START_PHASES);
        assert!(recorder.bytes[1..=ELEMENT_COUNT]
            .iter()
            .all(|&b| b == PHASE_OFF));
        assert_eq!(recorder.bytes[ELEMENT_COUNT + 1], CMD_SWAP_BUFFERS);
        assert_eq!(recorder.flushes, 2);
    }
}
