//! Incremental splat loading.
//!
//! `load_stream` is transport independent: it takes the announced length and any stream of
//! byte chunks, so the HTTP path and tests share the same code. The format is resolved once
//! from the first four bytes. Native data is handed to the sorter as growing prefixes of
//! complete records; PLY data is forwarded once, whole, after the stream ends.

use futures::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::error::{Result, ViewerError};
use crate::sorter::SorterRequest;
use crate::structures::{complete_records, SplatFormat, PLY_MAGIC, RECORD_SIZE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadStatus {
    /// `expected_records` is 0 for PLY sources; their count is known only after conversion.
    Started {
        format: SplatFormat,
        expected_records: usize,
    },
    Progress {
        records: usize,
    },
    Finished {
        records: usize,
    },
    Failed(String),
}

/// Receives what the loader produces. Implemented by the sorter handle and by test collectors.
pub trait SplatSink {
    fn submit(&mut self, request: SorterRequest) -> Result<()>;

    fn report(&mut self, _status: LoadStatus) {}

    /// False while an earlier records request is still being sorted. Growing prefixes are
    /// held back until then; the final exact count is always sent.
    fn accepts_records(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSummary {
    pub format: SplatFormat,
    pub bytes_read: usize,
    pub record_count: usize,
}

/// Validates the response line. Only `200` is accepted, and the body must announce its size.
pub fn check_response(status: u16, content_length: Option<u64>, url: &str) -> Result<usize> {
    if status != 200 {
        return Err(ViewerError::HttpStatus {
            status,
            url: url.to_string(),
        });
    }
    content_length
        .map(|len| len as usize)
        .ok_or_else(|| ViewerError::MissingContentLength(url.to_string()))
}

pub async fn load_stream<S, B, K>(content_length: usize, stream: S, sink: &mut K) -> Result<LoadSummary>
where
    S: Stream<Item = Result<B>>,
    B: AsRef<[u8]>,
    K: SplatSink + ?Sized,
{
    let result = read_stream(content_length, stream, sink).await;
    if let Err(e) = &result {
        sink.report(LoadStatus::Failed(e.to_string()));
    }
    result
}

async fn read_stream<S, B, K>(content_length: usize, stream: S, sink: &mut K) -> Result<LoadSummary>
where
    S: Stream<Item = Result<B>>,
    B: AsRef<[u8]>,
    K: SplatSink + ?Sized,
{
    let mut stream = std::pin::pin!(stream);
    let mut buffer = vec![0u8; content_length];
    let mut bytes_read = 0usize;
    let mut format = None;
    let mut last_sent = 0usize;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        let chunk = chunk.as_ref();
        let end = bytes_read + chunk.len();
        if end > content_length {
            return Err(ViewerError::LengthMismatch {
                expected: content_length,
                received: end,
            });
        }
        buffer[bytes_read..end].copy_from_slice(chunk);
        bytes_read = end;

        if format.is_none() {
            format = SplatFormat::detect(&buffer[..bytes_read]);
            if let Some(format) = format {
                let expected_records = match format {
                    SplatFormat::Native => complete_records(content_length),
                    SplatFormat::Ply => 0,
                };
                debug!("stream format {:?}, {} bytes announced", format, content_length);
                sink.report(LoadStatus::Started {
                    format,
                    expected_records,
                });
            }
        }

        if format == Some(SplatFormat::Native) {
            let records = complete_records(bytes_read);
            if records > last_sent && sink.accepts_records() {
                sink.submit(SorterRequest::Records {
                    buffer: buffer[..records * RECORD_SIZE].to_vec(),
                    record_count: records,
                })?;
                sink.report(LoadStatus::Progress { records });
                last_sent = records;
            }
        }
    }

    if bytes_read < content_length {
        warn!(
            "stream ended after {} of {} announced bytes",
            bytes_read, content_length
        );
    }
    buffer.truncate(bytes_read);

    // Streams shorter than the magic are treated as native data with no records.
    let format = format.unwrap_or(SplatFormat::Native);
    let record_count = finish(format, buffer, false, sink)?;
    info!("load finished: {:?}, {} bytes", format, bytes_read);

    Ok(LoadSummary {
        format,
        bytes_read,
        record_count,
    })
}

/// Loads an in-memory file, such as one dropped onto the viewer. PLY input is converted
/// with `save` set so the host can offer the converted buffer.
pub fn load_bytes<K>(bytes: Vec<u8>, sink: &mut K) -> Result<LoadSummary>
where
    K: SplatSink + ?Sized,
{
    let bytes_read = bytes.len();
    let format = SplatFormat::detect(&bytes).unwrap_or(SplatFormat::Native);
    sink.report(LoadStatus::Started {
        format,
        expected_records: match format {
            SplatFormat::Native => complete_records(bytes_read),
            SplatFormat::Ply => 0,
        },
    });
    let record_count = match finish(format, bytes, true, sink) {
        Ok(count) => count,
        Err(e) => {
            sink.report(LoadStatus::Failed(e.to_string()));
            return Err(e);
        }
    };
    Ok(LoadSummary {
        format,
        bytes_read,
        record_count,
    })
}

fn finish<K>(format: SplatFormat, mut buffer: Vec<u8>, save: bool, sink: &mut K) -> Result<usize>
where
    K: SplatSink + ?Sized,
{
    match format {
        SplatFormat::Ply => {
            debug_assert!(buffer.starts_with(&PLY_MAGIC));
            sink.submit(SorterRequest::ConvertPly { buffer, save })?;
            sink.report(LoadStatus::Finished { records: 0 });
            Ok(0)
        }
        SplatFormat::Native => {
            let records = complete_records(buffer.len());
            buffer.truncate(records * RECORD_SIZE);
            sink.submit(SorterRequest::Records {
                buffer,
                record_count: records,
            })?;
            sink.report(LoadStatus::Finished { records });
            Ok(records)
        }
    }
}

cfg_if::cfg_if! {
if #[cfg(feature = "http")] {
    /// Streams `url` into `sink`. No retries; the caller decides what to do on failure.
    pub async fn fetch<K>(url: &str, sink: &mut K) -> Result<LoadSummary>
    where
        K: SplatSink + ?Sized,
    {
        let response = match reqwest::get(url).await {
            Ok(response) => response,
            Err(e) => {
                let err = ViewerError::Network(e.to_string());
                sink.report(LoadStatus::Failed(err.to_string()));
                return Err(err);
            }
        };

        let final_url = response.url().to_string();
        let content_length = match check_response(
            response.status().as_u16(),
            response.content_length(),
            &final_url,
        ) {
            Ok(len) => len,
            Err(e) => {
                sink.report(LoadStatus::Failed(e.to_string()));
                return Err(e);
            }
        };

        info!("fetching {} ({} bytes)", final_url, content_length);
        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| ViewerError::Network(e.to_string())));
        load_stream(content_length, chunks, sink).await
    }
}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SorterConfig;
    use crate::sorter::{DepthSorter, SorterResponse};
    use futures::stream;
    use glam::Mat4;
    use std::cell::Cell;

    #[derive(Default)]
    struct Recorder {
        requests: Vec<SorterRequest>,
        statuses: Vec<LoadStatus>,
    }

    impl SplatSink for Recorder {
        fn submit(&mut self, request: SorterRequest) -> Result<()> {
            self.requests.push(request);
            Ok(())
        }

        fn report(&mut self, status: LoadStatus) {
            self.statuses.push(status);
        }
    }

    /// Feeds every request straight into a sorter and remembers each reported vertex count.
    struct SortingSink {
        sorter: DepthSorter,
        vertex_counts: Vec<usize>,
    }

    impl SplatSink for SortingSink {
        fn submit(&mut self, request: SorterRequest) -> Result<()> {
            for response in self.sorter.handle(request) {
                if let SorterResponse::DepthIndex { vertex_count, .. } = response {
                    self.vertex_counts.push(vertex_count);
                }
            }
            Ok(())
        }
    }

    fn native_bytes(records: usize) -> Vec<u8> {
        (0..records * RECORD_SIZE).map(|i| (i % 7) as u8 + 1).collect()
    }

    fn chunked(data: &[u8], size: usize) -> Vec<Result<Vec<u8>>> {
        data.chunks(size).map(|c| Ok(c.to_vec())).collect()
    }

    fn record_counts(requests: &[SorterRequest]) -> Vec<usize> {
        requests
            .iter()
            .filter_map(|r| match r {
                SorterRequest::Records {
                    buffer,
                    record_count,
                } => {
                    assert_eq!(buffer.len(), record_count * RECORD_SIZE);
                    Some(*record_count)
                }
                _ => None,
            })
            .collect()
    }

    /// Accepts one records request, then stays busy for `busy_polls` checks.
    struct SlowSink {
        inner: Recorder,
        busy_polls: usize,
        remaining: Cell<usize>,
    }

    impl SplatSink for SlowSink {
        fn submit(&mut self, request: SorterRequest) -> Result<()> {
            if matches!(request, SorterRequest::Records { .. }) {
                self.remaining.set(self.busy_polls);
            }
            self.inner.submit(request)
        }

        fn accepts_records(&self) -> bool {
            let left = self.remaining.get();
            self.remaining.set(left.saturating_sub(1));
            left == 0
        }
    }

    fn copied_bytes(requests: &[SorterRequest]) -> usize {
        record_counts(requests).iter().map(|n| n * RECORD_SIZE).sum()
    }

    #[tokio::test]
    async fn busy_sorter_holds_back_growing_prefixes() {
        let data = native_bytes(20_000);
        let chunks = chunked(&data, 16 * 1024);
        assert_eq!(chunks.len(), 40);

        let mut stalled = SlowSink {
            inner: Recorder::default(),
            busy_polls: usize::MAX,
            remaining: Cell::new(0),
        };
        load_stream(data.len(), stream::iter(chunked(&data, 16 * 1024)), &mut stalled)
            .await
            .unwrap();
        assert_eq!(record_counts(&stalled.inner.requests), vec![512, 20_000]);
        assert!(copied_bytes(&stalled.inner.requests) < 2 * data.len());

        let mut slow = SlowSink {
            inner: Recorder::default(),
            busy_polls: 4,
            remaining: Cell::new(0),
        };
        load_stream(data.len(), stream::iter(chunks), &mut slow)
            .await
            .unwrap();
        let counts = record_counts(&slow.inner.requests);
        assert!(counts.len() <= 40 / 5 + 2, "{} messages", counts.len());
        assert!(counts.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(counts.last(), Some(&20_000));
    }

    #[tokio::test]
    async fn progressive_load_reaches_final_count() {
        let data = native_bytes(10_000);
        let chunks = chunked(&data, 2_000 * RECORD_SIZE);
        assert_eq!(chunks.len(), 5);

        let mut sink = SortingSink {
            sorter: DepthSorter::new(SorterConfig::default()),
            vertex_counts: Vec::new(),
        };
        sink.sorter.handle(SorterRequest::View {
            view_proj: Mat4::IDENTITY,
        });
        let summary = load_stream(data.len(), stream::iter(chunks), &mut sink)
            .await
            .unwrap();

        assert_eq!(summary.record_count, 10_000);
        assert_eq!(summary.format, SplatFormat::Native);
        assert!(sink.vertex_counts.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(sink.vertex_counts.first(), Some(&2_000));
        assert_eq!(sink.vertex_counts.last(), Some(&10_000));
    }

    #[tokio::test]
    async fn odd_chunks_never_expose_partial_records() {
        let data = native_bytes(50);
        let recorder = &mut Recorder::default();
        load_stream(data.len(), stream::iter(chunked(&data, 45)), recorder)
            .await
            .unwrap();

        let counts = record_counts(&recorder.requests);
        assert!(counts.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(counts.last(), Some(&50));
        assert!(matches!(
            recorder.statuses.first(),
            Some(LoadStatus::Started {
                format: SplatFormat::Native,
                expected_records: 50
            })
        ));
        assert_eq!(
            recorder.statuses.last(),
            Some(&LoadStatus::Finished { records: 50 })
        );
    }

    #[tokio::test]
    async fn trailing_bytes_are_dropped() {
        let mut data = native_bytes(9);
        data.extend_from_slice(&[0xEE; 17]);
        let mut recorder = Recorder::default();
        let summary = load_stream(data.len(), stream::iter(chunked(&data, 64)), &mut recorder)
            .await
            .unwrap();
        assert_eq!(summary.record_count, 9);
        assert_eq!(summary.bytes_read, 9 * RECORD_SIZE + 17);
        assert_eq!(record_counts(&recorder.requests).last(), Some(&9));
    }

    #[tokio::test]
    async fn ply_is_forwarded_once_after_the_stream() {
        let mut data = b"ply\nformat binary_little_endian 1.0\n".to_vec();
        data.extend_from_slice(&[0u8; 200]);
        let mut recorder = Recorder::default();
        load_stream(data.len(), stream::iter(chunked(&data, 16)), &mut recorder)
            .await
            .unwrap();

        assert_eq!(recorder.requests.len(), 1);
        match &recorder.requests[0] {
            SorterRequest::ConvertPly { buffer, save } => {
                assert_eq!(buffer, &data);
                assert!(!save);
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[tokio::test]
    async fn overflowing_stream_is_rejected() {
        let data = native_bytes(4);
        let mut recorder = Recorder::default();
        let err = load_stream(64, stream::iter(chunked(&data, 32)), &mut recorder)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ViewerError::LengthMismatch {
                expected: 64,
                received: 96
            }
        ));
        assert!(matches!(recorder.statuses.last(), Some(LoadStatus::Failed(_))));
    }

    #[tokio::test]
    async fn network_error_mid_stream_is_reported() {
        let chunks: Vec<Result<Vec<u8>>> = vec![
            Ok(native_bytes(2)),
            Err(ViewerError::Network("connection reset".to_string())),
        ];
        let mut recorder = Recorder::default();
        let err = load_stream(320, stream::iter(chunks), &mut recorder)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Network error: connection reset");
        assert_eq!(record_counts(&recorder.requests), vec![2]);
        assert_eq!(
            recorder.statuses.last(),
            Some(&LoadStatus::Failed("Network error: connection reset".to_string()))
        );
    }

    #[test]
    fn response_checks() {
        assert_eq!(check_response(200, Some(640), "u").unwrap(), 640);
        let err = check_response(404, Some(1), "https://x/scene.splat").unwrap_err();
        assert_eq!(err.to_string(), "404 Unable to load https://x/scene.splat");
        assert!(matches!(
            check_response(200, None, "u"),
            Err(ViewerError::MissingContentLength(_))
        ));
    }

    #[test]
    fn dropped_ply_file_asks_to_save() {
        let mut recorder = Recorder::default();
        let summary = load_bytes(b"ply\nformat ascii 1.0\n".to_vec(), &mut recorder).unwrap();
        assert_eq!(summary.format, SplatFormat::Ply);
        assert!(matches!(
            recorder.requests.as_slice(),
            [SorterRequest::ConvertPly { save: true, .. }]
        ));
    }
}
