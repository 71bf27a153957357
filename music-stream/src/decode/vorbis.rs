//! Ogg Vorbis decoding using `lewton`

use std::fs::File;
use std::io::{BufReader, Read, Seek};

use lewton::inside_ogg::OggStreamReader;
use tracing::{debug, trace};

use super::{TrackDecoder, TrackLoader};
use crate::device::{SampleFormat, MIN_SAMPLE_RATE};
use crate::error::DecodeError;
use crate::track::{TrackId, TrackInfo, TrackTable};

/// Frames decoded ahead of a seek target. Vorbis packets overlap, so the
/// first packet after a page seek yields no audio, and the page found may
/// start well before the target.
const SEEK_PREROLL: u64 = 8192;

/// Decoded packets with page-granular seeking
trait PacketSource {
    /// Next packet as interleaved samples; `None` at end of stream
    fn next_packet(&mut self) -> Result<Option<Vec<i16>>, DecodeError>;

    /// Granule position just past the last returned packet. Unknown after a
    /// seek until a packet that ends a page has been read.
    fn position(&self) -> Option<u64>;

    /// Jump to the start of a page at or before `granule`
    fn seek_page(&mut self, granule: u64) -> Result<(), DecodeError>;
}

impl<R: Read + Seek> PacketSource for OggStreamReader<R> {
    fn next_packet(&mut self) -> Result<Option<Vec<i16>>, DecodeError> {
        Ok(self.read_dec_packet_itl()?)
    }

    fn position(&self) -> Option<u64> {
        self.get_last_absgp()
    }

    fn seek_page(&mut self, granule: u64) -> Result<(), DecodeError> {
        self.seek_absgp_pg(granule)?;
        Ok(())
    }
}

/// Byte cursor over a packet source.
///
/// Bytes left over from a packet that didn't fit the caller's buffer are
/// served by the next `read`.
struct PcmStream<S> {
    source: S,
    channels: usize,
    /// Little-endian bytes decoded but not yet read
    pending: Vec<u8>,
    cursor: usize,
}

impl<S: PacketSource> PcmStream<S> {
    fn new(source: S, channels: usize) -> Self {
        Self {
            source,
            channels,
            pending: Vec::new(),
            cursor: 0,
        }
    }

    fn read(&mut self, out: &mut [u8]) -> Result<usize, DecodeError> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.cursor >= self.pending.len() && !self.refill()? {
            return Ok(0);
        }

        let available = &self.pending[self.cursor..];
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.cursor += n;
        Ok(n)
    }

    /// Decode packets until one yields samples. Returns false at end of stream.
    fn refill(&mut self) -> Result<bool, DecodeError> {
        loop {
            match self.source.next_packet()? {
                Some(packet) if packet.is_empty() => continue,
                Some(packet) => {
                    self.pending.clear();
                    self.cursor = 0;
                    self.append(&packet);
                    return Ok(true);
                }
                None => return Ok(false),
            }
        }
    }

    /// Position the stream so the next `read` starts at frame `target`.
    ///
    /// Seeks to a page [`SEEK_PREROLL`] frames early, decodes until the
    /// granule position is known, then drops everything before `target`.
    fn seek(&mut self, target: u64) -> Result<(), DecodeError> {
        self.pending.clear();
        self.cursor = 0;
        self.source.seek_page(target.saturating_sub(SEEK_PREROLL))?;

        let mut decoded = Vec::new();
        let end = loop {
            let Some(packet) = self.source.next_packet()? else {
                // Target is past the end; the next read reports it
                return Ok(());
            };
            decoded.push(packet);
            if let Some(end) = self.source.position() {
                break end;
            }
        };

        // Count back from the known position to place the buffered packets
        let buffered: u64 = decoded.iter().map(|p| self.frames(p)).sum();
        let mut start = end.saturating_sub(buffered);
        for packet in &decoded {
            self.place(packet, &mut start, target);
        }

        while self.pending.is_empty() {
            let Some(packet) = self.source.next_packet()? else {
                return Ok(());
            };
            self.place(&packet, &mut start, target);
        }
        Ok(())
    }

    /// Keep the part of `packet` at or after `target`. `start` is the frame
    /// where the packet begins and is advanced past it.
    fn place(&mut self, packet: &[i16], start: &mut u64, target: u64) {
        let begin = *start;
        *start += self.frames(packet);
        if *start <= target {
            return;
        }
        let skip = (target.saturating_sub(begin) as usize) * self.channels;
        self.append(&packet[skip..]);
    }

    fn frames(&self, packet: &[i16]) -> u64 {
        (packet.len() / self.channels) as u64
    }

    fn append(&mut self, samples: &[i16]) {
        self.pending
            .extend(samples.iter().flat_map(|s| s.to_le_bytes()));
    }
}

/// Streaming Vorbis decoder.
///
/// Packets are decoded on demand. Seeks are sample-exact.
pub struct VorbisDecoder<R: Read + Seek = BufReader<File>> {
    stream: PcmStream<OggStreamReader<R>>,
    info: TrackInfo,
}

impl VorbisDecoder {
    /// Open a file from disk.
    pub fn open(path: &std::path::Path) -> Result<Self, DecodeError> {
        let file = File::open(path)?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read + Seek> VorbisDecoder<R> {
    /// Parse the stream headers from `source`.
    pub fn new(source: R) -> Result<Self, DecodeError> {
        let reader = OggStreamReader::new(source)?;

        let channels = reader.ident_hdr.audio_channels;
        let format =
            SampleFormat::from_channels(channels).ok_or(DecodeError::UnsupportedChannels(channels))?;

        let sample_rate = reader.ident_hdr.audio_sample_rate;
        if sample_rate < MIN_SAMPLE_RATE {
            return Err(DecodeError::UnsupportedRate(sample_rate));
        }

        let info = TrackInfo {
            channels,
            sample_rate,
            format,
            vendor: reader.comment_hdr.vendor.clone(),
            comments: reader.comment_hdr.comment_list.clone(),
        };

        Ok(Self {
            stream: PcmStream::new(reader, format.channels()),
            info,
        })
    }
}

impl<R: Read + Seek + Send> TrackDecoder for VorbisDecoder<R> {
    fn info(&self) -> &TrackInfo {
        &self.info
    }

    fn read(&mut self, out: &mut [u8]) -> Result<usize, DecodeError> {
        self.stream.read(out)
    }

    fn seek(&mut self, seconds: f64) -> Result<(), DecodeError> {
        let granule = (seconds.max(0.0) * self.info.sample_rate as f64) as u64;
        trace!("Vorbis seek to {:.3}s (granule {})", seconds, granule);
        self.stream.seek(granule)
    }
}

/// Opens tracks from a [`TrackTable`] as Vorbis files.
#[derive(Debug, Clone)]
pub struct VorbisLibrary {
    table: TrackTable,
}

impl VorbisLibrary {
    pub fn new(table: TrackTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &TrackTable {
        &self.table
    }
}

impl TrackLoader for VorbisLibrary {
    type Decoder = VorbisDecoder;

    fn open(&self, track: TrackId) -> Result<Self::Decoder, DecodeError> {
        let path = self.table.path(track)?;
        let decoder = VorbisDecoder::open(path)?;
        debug!(
            "Opened {} ({} ch @ {} Hz)",
            path.display(),
            decoder.info.channels,
            decoder.info.sample_rate
        );
        Ok(decoder)
    }

    fn describe(&self, track: TrackId) -> String {
        match self.table.name(track) {
            Some(name) => format!("'{}'", name),
            None => track.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Mono stream whose samples hold their own frame index, in pages of
    /// `per_page` packets. Packet 0 is empty like a real stream's first
    /// packet, and the first packet after a seek decodes to nothing.
    struct Pages {
        /// (first frame, frames) per packet
        packets: Vec<(u64, u64)>,
        per_page: usize,
        next: usize,
        position: Option<u64>,
        primed: bool,
        seeks: Vec<u64>,
    }

    impl Pages {
        fn new(count: usize, packet_frames: u64, per_page: usize) -> Self {
            let mut packets = vec![(0, 0)];
            packets.extend((0..count as u64 - 1).map(|i| (i * packet_frames, packet_frames)));
            Self {
                packets,
                per_page,
                next: 0,
                position: None,
                primed: false,
                seeks: Vec::new(),
            }
        }
    }

    impl PacketSource for Pages {
        fn next_packet(&mut self) -> Result<Option<Vec<i16>>, DecodeError> {
            let Some(&(start, frames)) = self.packets.get(self.next) else {
                return Ok(None);
            };
            self.next += 1;
            let ends_page = self.next % self.per_page == 0 || self.next == self.packets.len();

            let samples: Vec<i16> = if std::mem::take(&mut self.primed) {
                Vec::new()
            } else {
                (start..start + frames).map(|f| f as i16).collect()
            };
            if ends_page {
                self.position = Some(start + frames);
            } else if let Some(position) = self.position.as_mut() {
                *position += samples.len() as u64;
            }
            Ok(Some(samples))
        }

        fn position(&self) -> Option<u64> {
            self.position
        }

        fn seek_page(&mut self, granule: u64) -> Result<(), DecodeError> {
            let page = (0..self.packets.len())
                .step_by(self.per_page)
                .take_while(|&first| self.packets[first].0 <= granule)
                .last()
                .unwrap_or(0);
            self.next = page;
            self.position = None;
            self.primed = true;
            self.seeks.push(granule);
            Ok(())
        }
    }

    fn read_samples(stream: &mut PcmStream<Pages>, count: usize) -> Vec<i16> {
        let mut bytes = Vec::new();
        // Odd-sized reads so samples straddle read calls
        let mut buf = [0u8; 7];
        while bytes.len() < count * 2 {
            let n = stream.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            bytes.extend_from_slice(&buf[..n]);
        }
        bytes.truncate(count * 2);
        bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    #[test]
    fn test_sequential_reads_are_continuous() {
        let mut stream = PcmStream::new(Pages::new(40, 512, 4), 1);
        let samples = read_samples(&mut stream, 3000);
        assert_eq!(samples, (0..3000).collect::<Vec<i16>>());
    }

    #[test]
    fn test_seek_lands_on_the_exact_frame() {
        let mut stream = PcmStream::new(Pages::new(40, 512, 4), 1);
        read_samples(&mut stream, 100);

        stream.seek(12_345).unwrap();
        assert_eq!(stream.source.seeks, vec![12_345 - SEEK_PREROLL]);
        let samples = read_samples(&mut stream, 2000);
        assert_eq!(samples, (12_345..14_345).collect::<Vec<i16>>());
    }

    #[test]
    fn test_seek_inside_the_first_decoded_page() {
        let mut stream = PcmStream::new(Pages::new(40, 512, 4), 1);
        stream.seek(1000).unwrap();
        assert_eq!(stream.source.seeks, vec![0]);
        // Runs from the buffered packets into freshly decoded ones
        let samples = read_samples(&mut stream, 1500);
        assert_eq!(samples, (1000..2500).collect::<Vec<i16>>());
    }

    #[test]
    fn test_seek_to_start_and_back() {
        let mut stream = PcmStream::new(Pages::new(40, 512, 4), 1);
        stream.seek(9000).unwrap();
        assert_eq!(read_samples(&mut stream, 1), vec![9000]);
        stream.seek(0).unwrap();
        assert_eq!(read_samples(&mut stream, 600), (0..600).collect::<Vec<i16>>());
    }

    #[test]
    fn test_seek_past_end_reads_nothing() {
        let mut stream = PcmStream::new(Pages::new(40, 512, 4), 1);
        stream.seek(30_000).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_garbage_stream_is_rejected() {
        let bytes = vec![0x42u8; 256];
        let result = VorbisDecoder::new(Cursor::new(bytes));
        assert!(matches!(result, Err(DecodeError::Vorbis(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = VorbisDecoder::open(&dir.path().join("missing.ogg"));
        assert!(matches!(result, Err(DecodeError::Io(_))));
    }

    #[test]
    fn test_library_unknown_track() {
        let library = VorbisLibrary::new(TrackTable::new());
        let result = library.open(TrackId::new(0));
        assert!(matches!(result, Err(DecodeError::UnknownTrack(_))));
    }

    #[test]
    fn test_library_describe_uses_table_names() {
        let mut table = TrackTable::new();
        let id = table.insert("title", "title.ogg", 0.0).unwrap();
        let library = VorbisLibrary::new(table);
        assert_eq!(library.describe(id), "'title'");
        assert_eq!(library.describe(TrackId::new(9)), "#9");
    }
}
