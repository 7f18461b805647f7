use std::{
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use anyhow::Result;
use futures::SinkExt;
use futures_lite::{io::AsyncWrite, io::Cursor, AsyncReadExt, StreamExt};
use tarform::{chunks, parse_multipart, Error, FormPart, MultipartWriter};

const BOUNDARY: &str = "----formdata-0123456789abcdef";

fn content_type() -> String {
    format!("multipart/form-data; boundary={}", BOUNDARY)
}

struct VecAsyncWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl VecAsyncWriter {
    fn new() -> (Self, Arc<Mutex<Vec<u8>>>) {
        let inner = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                inner: inner.clone(),
            },
            inner,
        )
    }
}

impl AsyncWrite for VecAsyncWriter {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.inner.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: std::pin::Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: std::pin::Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

type Part = FormPart<Cursor<Vec<u8>>>;

fn encode(parts: Vec<Part>) -> Result<Vec<u8>> {
    smol::block_on(async {
        let (sink, shared) = VecAsyncWriter::new();
        let mut writer: MultipartWriter<_, Cursor<Vec<u8>>> =
            MultipartWriter::with_boundary(sink, BOUNDARY);
        for part in parts {
            writer.send(part).await?;
        }
        writer.close().await?;
        let wire = shared.lock().unwrap().clone();
        Ok(wire)
    })
}

#[derive(Debug, PartialEq)]
struct Decoded {
    name: String,
    content_type: String,
    size: Option<u64>,
    bytes: Vec<u8>,
}

fn decode_with_chunk(wire: &[u8], chunk: usize) -> Result<Vec<Decoded>> {
    smol::block_on(async {
        let mut reader = parse_multipart(chunks(wire.to_vec(), chunk), &content_type())?;
        let mut out = Vec::new();
        while let Some(part) = reader.next().await {
            let part = part?;
            let bytes = part.bytes().await?;
            out.push(Decoded {
                name: part.name().to_string(),
                content_type: part.content_type().to_string(),
                size: part.size(),
                bytes,
            });
        }
        Ok(out)
    })
}

fn decode(wire: &[u8]) -> Result<Vec<Decoded>> {
    decode_with_chunk(wire, 4096)
}

#[test]
fn two_text_fields_exact_wire() -> Result<()> {
    let wire = encode(vec![FormPart::text("a", "1"), FormPart::text("b", "2")])?;
    let expected = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\n1\r\n\
         --{b}\r\nContent-Disposition: form-data; name=\"b\"\r\n\r\n2\r\n\
         --{b}--\r\n\r\n",
        b = BOUNDARY
    );
    assert_eq!(String::from_utf8_lossy(&wire), expected);

    let parts = decode(&wire)?;
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0].name, "a");
    assert_eq!(parts[0].bytes, b"1");
    assert_eq!(parts[0].content_type, "application/octet-stream");
    assert_eq!(parts[1].name, "b");
    assert_eq!(parts[1].bytes, b"2");
    Ok(())
}

#[test]
fn special_filename_round_trip() -> Result<()> {
    let filename = "newline\nfi+l en\"am\u{1F44D}e.txt";
    let wire = encode(vec![FormPart::file(
        "file",
        filename,
        Cursor::new(b"content".to_vec()),
    )])?;
    let text = String::from_utf8_lossy(&wire);
    assert!(
        text.contains("filename=\"newline%0Afi+l en%22am\u{1F44D}e.txt\""),
        "wire was: {}",
        text
    );
    smol::block_on(async {
        let mut reader = parse_multipart(chunks(wire, 4096), &content_type())?;
        let part = reader.next().await.unwrap()?;
        assert_eq!(part.name(), filename);
        assert_eq!(part.field_name(), Some("file"));
        assert_eq!(part.filename(), Some(filename));
        assert_eq!(part.bytes().await?, b"content");
        Ok(())
    })
}

#[test]
fn chunk_size_invariance() -> Result<()> {
    let wire = encode(vec![
        FormPart::text("first", "some value"),
        FormPart::file("second", "data.bin", Cursor::new(vec![0x42u8; 5000]))
            .with_content_type("application/x-test"),
        FormPart::text("third", ""),
    ])?;
    let reference = decode_with_chunk(&wire, wire.len())?;
    assert_eq!(reference.len(), 3);
    assert_eq!(reference[1].content_type, "application/x-test");
    assert_eq!(reference[1].bytes.len(), 5000);
    assert_eq!(reference[2].bytes, b"");
    for chunk in [1usize, 3, 7, 500, 4096] {
        assert_eq!(decode_with_chunk(&wire, chunk)?, reference, "chunk {}", chunk);
    }
    Ok(())
}

#[test]
fn sized_parts_round_trip() -> Result<()> {
    let data = vec![7u8; 9000];
    let wire = encode(vec![
        FormPart::file("blob", "blob.bin", Cursor::new(data.clone())).with_size(9000)
    ])?;
    assert!(String::from_utf8_lossy(&wire).contains("Content-Length: 9000\r\n"));
    let parts = decode(&wire)?;
    assert_eq!(parts[0].size, Some(9000));
    assert_eq!(parts[0].bytes, data);
    Ok(())
}

#[test]
fn skip_every_other_sized() -> Result<()> {
    skip_every_other(true)
}

#[test]
fn skip_every_other_unsized() -> Result<()> {
    skip_every_other(false)
}

fn skip_every_other(sized: bool) -> Result<()> {
    let contents: Vec<Vec<u8>> = (0..6u8)
        .map(|i| format!("file number {} contents {}", i, "x".repeat(i as usize * 700)).into_bytes())
        .collect();
    let parts = contents
        .iter()
        .enumerate()
        .map(|(i, data)| {
            let part = FormPart::file(
                format!("f{}", i),
                format!("file{}.txt", i),
                Cursor::new(data.clone()),
            );
            if sized {
                part.with_size(data.len() as u64)
            } else {
                part
            }
        })
        .collect();
    let wire = encode(parts)?;
    smol::block_on(async {
        let mut reader = parse_multipart(chunks(wire, 333), &content_type())?;
        for i in 0..6usize {
            let part = reader.next().await.unwrap()?;
            if i % 2 == 1 {
                // cancelled without touching the payload
                continue;
            }
            assert_eq!(part.filename(), Some(format!("file{}.txt", i).as_str()));
            assert_eq!(part.bytes().await?, contents[i]);
        }
        assert!(reader.next().await.is_none());
        Ok(())
    })
}

#[test]
fn zero_length_bodies() -> Result<()> {
    let wire = encode(vec![
        FormPart::text("empty-text", ""),
        FormPart::file("empty-file", "empty.bin", Cursor::new(Vec::new())),
    ])?;
    let parts = decode(&wire)?;
    assert_eq!(parts[0].bytes, b"");
    assert_eq!(parts[1].bytes, b"");
    Ok(())
}

#[test]
fn preamble_is_discarded() -> Result<()> {
    let mut wire = b"This is the preamble. It should be ignored.\r\n".to_vec();
    wire.extend(encode(vec![FormPart::text("a", "1")])?);
    let parts = decode(&wire)?;
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].bytes, b"1");
    Ok(())
}

#[test]
fn oversized_preamble_is_fatal() -> Result<()> {
    let mut wire = vec![b'p'; 17 * 1024];
    wire.extend(encode(vec![FormPart::text("a", "1")])?);
    smol::block_on(async {
        let mut reader = parse_multipart(chunks(wire, 4096), &content_type())?;
        assert!(matches!(
            reader.next().await,
            Some(Err(Error::LimitExceeded(_, _)))
        ));
        Ok(())
    })
}

#[test]
fn lying_content_length_is_fatal() -> Result<()> {
    let wire = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"x\"\r\nContent-Length: 3\r\n\r\n\
         hello\r\n--{b}--\r\n\r\n",
        b = BOUNDARY
    );
    smol::block_on(async {
        let mut reader = parse_multipart(chunks(wire.into_bytes(), 4096), &content_type())?;
        let part = reader.next().await.unwrap()?;
        // the sized fast path reads exactly the declared bytes
        assert_eq!(part.bytes().await?, b"hel");
        assert!(matches!(reader.next().await, Some(Err(Error::BadBoundary))));
        Ok(())
    })
}

#[test]
fn missing_terminal_boundary_is_fatal() -> Result<()> {
    let wire = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"x\"\r\n\r\ntruncated body",
        b = BOUNDARY
    );
    smol::block_on(async {
        let mut reader = parse_multipart(chunks(wire.into_bytes(), 64), &content_type())?;
        let _part = reader.next().await.unwrap()?;
        assert!(matches!(
            reader.next().await,
            Some(Err(Error::UnexpectedEof(_)))
        ));
        Ok(())
    })
}

#[test]
fn header_line_without_colon_is_fatal() -> Result<()> {
    let wire = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"x\"\r\nnot a header line\r\n\r\nbody\r\n--{b}--\r\n\r\n",
        b = BOUNDARY
    );
    expect_bad_header(wire)
}

#[test]
fn non_form_data_disposition_is_fatal() -> Result<()> {
    let wire = format!(
        "--{b}\r\nContent-Disposition: attachment; name=\"x\"\r\n\r\nbody\r\n--{b}--\r\n\r\n",
        b = BOUNDARY
    );
    expect_bad_header(wire)
}

#[test]
fn part_without_name_or_filename_is_fatal() -> Result<()> {
    let wire = format!(
        "--{b}\r\nContent-Disposition: form-data\r\n\r\nbody\r\n--{b}--\r\n\r\n",
        b = BOUNDARY
    );
    expect_bad_header(wire)
}

fn expect_bad_header(wire: String) -> Result<()> {
    smol::block_on(async {
        let mut reader = parse_multipart(chunks(wire.into_bytes(), 4096), &content_type())?;
        assert!(matches!(
            reader.next().await,
            Some(Err(Error::BadHeader(_)))
        ));
        Ok(())
    })
}

#[test]
fn foreign_headers_are_surfaced() -> Result<()> {
    let wire = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"x\"\r\nX-Extra: kept as-is\r\n\r\nbody\r\n--{b}--\r\n\r\n",
        b = BOUNDARY
    );
    smol::block_on(async {
        let mut reader = parse_multipart(chunks(wire.into_bytes(), 4096), &content_type())?;
        let part = reader.next().await.unwrap()?;
        assert_eq!(part.headers().get("x-extra"), Some("kept as-is"));
        assert_eq!(part.content_type(), "application/octet-stream");
        assert_eq!(part.bytes().await?, b"body");
        Ok(())
    })
}

#[test]
fn missing_boundary_parameter_is_rejected() {
    let err = smol::block_on(async {
        parse_multipart(chunks(Vec::new(), 1), "multipart/form-data").err()
    });
    assert!(matches!(err, Some(Error::BadHeader(_))));
}

#[test]
fn quoted_boundary_parameter_is_accepted() -> Result<()> {
    let wire = encode(vec![FormPart::text("a", "1")])?;
    let quoted = format!("multipart/form-data; boundary=\"{}\"", BOUNDARY);
    smol::block_on(async {
        let mut reader = parse_multipart(chunks(wire, 4096), &quoted)?;
        let part = reader.next().await.unwrap()?;
        assert_eq!(part.bytes().await?, b"1");
        Ok(())
    })
}

#[test]
fn stale_body_handle_fails_after_advancing() -> Result<()> {
    let wire = encode(vec![FormPart::text("a", "1111"), FormPart::text("b", "2222")])?;
    smol::block_on(async {
        let mut reader = parse_multipart(chunks(wire, 4096), &content_type())?;
        let a = reader.next().await.unwrap()?;
        let _b = reader.next().await.unwrap()?;
        let mut buf = Vec::new();
        let err = a.body().read_to_end(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
        Ok(())
    })
}
