//! Property tests for the byte-stream and chunk codecs: whatever goes in
//! must come back out, bit for bit.

use proptest::prelude::*;
use tempora::codec::{
    compress_doubles, decode_chunk, decompress_doubles, delta_rle_reader, delta_rle_writer,
    encode_chunk, rle_len_reader, rle_len_writer, to_chunk_order, to_time_order, SignedSink,
    SignedSource, StreamReader, StreamSink, StreamSource, StreamWriter,
};
use tempora::types::{Sample, UncompressedChunk, MAX_PARAM_ID};

proptest! {
    #[test]
    fn base128_round_trips(values in prop::collection::vec(any::<u64>(), 0..200)) {
        let mut buf = vec![0u8; values.len() * 10 + 16];
        let mut w = StreamWriter::new(&mut buf);
        for v in &values {
            w.put_base128(*v).unwrap();
        }
        let written = w.size();
        let mut r = StreamReader::new(&buf[..written]);
        for v in &values {
            prop_assert_eq!(r.read_base128().unwrap(), *v);
        }
        prop_assert_eq!(r.space_left(), 0);
    }

    #[test]
    fn delta_rle_round_trips(values in prop::collection::vec(any::<i64>(), 0..200)) {
        let mut buf = vec![0u8; values.len() * 22 + 32];
        let mut w = StreamWriter::new(&mut buf);
        {
            let mut sink = delta_rle_writer(&mut w);
            for v in &values {
                sink.put(*v).unwrap();
            }
            sink.commit().unwrap();
        }
        let written = w.size();
        let mut r = StreamReader::new(&buf[..written]);
        let mut source = delta_rle_reader(&mut r);
        for v in &values {
            prop_assert_eq!(source.next().unwrap(), *v);
        }
    }

    #[test]
    fn rle_round_trips(values in prop::collection::vec(0u64..16, 0..300)) {
        let mut buf = vec![0u8; values.len() * 20 + 32];
        let mut w = StreamWriter::new(&mut buf);
        {
            let mut sink = rle_len_writer(&mut w);
            for v in &values {
                sink.put(*v).unwrap();
            }
            sink.commit().unwrap();
        }
        let written = w.size();
        let mut r = StreamReader::new(&buf[..written]);
        let mut source = rle_len_reader(&mut r);
        for v in &values {
            prop_assert_eq!(source.next().unwrap(), *v);
        }
    }

    #[test]
    fn doubles_round_trip_bit_exact(bits in prop::collection::vec(any::<u64>(), 0..200)) {
        let values: Vec<f64> = bits.iter().map(|b| f64::from_bits(*b)).collect();
        let mut buf = vec![0u8; values.len() * 10 + 32];
        let mut w = StreamWriter::new(&mut buf);
        let n = compress_doubles(&values, &mut w).unwrap();
        prop_assert_eq!(n, values.len());
        let written = w.size();
        let mut r = StreamReader::new(&buf[..written]);
        let mut out = Vec::new();
        decompress_doubles(&mut r, n, &mut out).unwrap();
        let out_bits: Vec<u64> = out.iter().map(|v| v.to_bits()).collect();
        prop_assert_eq!(out_bits, bits);
    }

    #[test]
    fn chunks_round_trip(rows in prop::collection::vec(
        (0u64..MAX_PARAM_ID, any::<u64>(), any::<u64>()),
        1..300,
    )) {
        let mut chunk = UncompressedChunk::default();
        for (id, ts, value_bits) in &rows {
            chunk.push(Sample::new(*id, *ts, f64::from_bits(*value_bits)));
        }
        let chunk = to_chunk_order(&chunk);
        let mut buf = vec![0u8; rows.len() * 40 + 64];
        let mut w = StreamWriter::new(&mut buf);
        let meta = encode_chunk(&chunk, &mut w).unwrap();
        prop_assert_eq!(meta.n_elements as usize, rows.len());
        let written = w.size();

        let decoded = decode_chunk(&buf[..written], meta.n_elements).unwrap();
        prop_assert_eq!(decoded.timestamps, chunk.timestamps);
        prop_assert_eq!(decoded.paramids, chunk.paramids);
        let lhs: Vec<u64> = decoded.values.iter().map(|v| v.to_bits()).collect();
        let rhs: Vec<u64> = chunk.values.iter().map(|v| v.to_bits()).collect();
        prop_assert_eq!(lhs, rhs);
    }

    #[test]
    fn order_conversions_are_inverse_sorts(rows in prop::collection::vec(
        (0u64..64, 0u64..1024, any::<u64>()),
        0..200,
    )) {
        let mut chunk = UncompressedChunk::default();
        for (id, ts, value_bits) in &rows {
            chunk.push(Sample::new(*id, *ts, f64::from_bits(*value_bits)));
        }
        let chunked = to_chunk_order(&chunk);
        let timed = to_time_order(&chunked);
        for i in 1..chunked.len() {
            prop_assert!(chunked.row(i - 1).chunk_key() <= chunked.row(i).chunk_key());
        }
        for i in 1..timed.len() {
            prop_assert!(timed.row(i - 1).time_key() <= timed.row(i).time_key());
        }
        let mut lhs: Vec<(u64, u64, u64)> = (0..chunk.len())
            .map(|i| (chunk.paramids[i], chunk.timestamps[i], chunk.values[i].to_bits()))
            .collect();
        let mut rhs: Vec<(u64, u64, u64)> = (0..timed.len())
            .map(|i| (timed.paramids[i], timed.timestamps[i], timed.values[i].to_bits()))
            .collect();
        lhs.sort();
        rhs.sort();
        prop_assert_eq!(lhs, rhs);
    }
}
