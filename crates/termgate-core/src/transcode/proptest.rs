//! Property-based tests for the transcoder.
//!
//! Arbitrary text is encoded, cut at arbitrary points and fed back through
//! the output filter; the reassembled text must match exactly.

#![cfg(test)]

use encoding_rs::{BIG5, GB18030};
use proptest::prelude::*;

use super::{Charset, InputEncoder, OutputFilter};

fn sample_chars() -> Vec<char> {
    "abcXYZ019 ~\r\n\t中文测试繁體日本語한국어🎉€é".chars().collect()
}

prop_compose! {
    fn arb_text()(chars in prop::collection::vec(prop::sample::select(sample_chars()), 0..64)) -> String {
        chars.into_iter().collect()
    }
}

prop_compose! {
    fn arb_cuts()(cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..8)) -> Vec<prop::sample::Index> {
        cuts
    }
}

fn reassemble(charset: &str, encoded: &[u8], cuts: &[prop::sample::Index]) -> String {
    let mut offsets: Vec<usize> = cuts.iter().map(|i| i.index(encoded.len() + 1)).collect();
    offsets.push(0);
    offsets.push(encoded.len());
    offsets.sort_unstable();
    offsets.dedup();

    let mut filter = OutputFilter::for_charset(charset).unwrap();
    let mut out = Vec::new();
    for pair in offsets.windows(2) {
        out.extend_from_slice(&filter.filter(&encoded[pair[0]..pair[1]]).unwrap());
    }
    out.extend_from_slice(&filter.finish().unwrap());
    String::from_utf8(out).unwrap()
}

proptest! {
    #[test]
    fn gb18030_survives_any_chunking(text in arb_text(), cuts in arb_cuts()) {
        let (encoded, _, unmappable) = GB18030.encode(&text);
        prop_assert!(!unmappable);
        prop_assert_eq!(&reassemble("GB18030", &encoded, &cuts), &text);
    }

    #[test]
    fn utf16_survives_any_chunking(text in arb_text(), cuts in arb_cuts()) {
        let encoded = InputEncoder::new(Charset::Utf16 { big_endian: false, use_bom: false })
            .encode(text.as_bytes())
            .into_owned();
        prop_assert_eq!(&reassemble("UTF-16-LE", &encoded, &cuts), &text);
    }

    #[test]
    fn utf8_survives_any_chunking(text in arb_text(), cuts in arb_cuts()) {
        prop_assert_eq!(&reassemble("UTF-8", text.as_bytes(), &cuts), &text);
    }

    #[test]
    fn arbitrary_bytes_never_panic(data in prop::collection::vec(any::<u8>(), 0..256)) {
        for charset in ["GBK", "HZ-GB2312", "BIG5", "ISO-2022-JP", "UTF-16-BOM"] {
            let mut filter = OutputFilter::for_charset(charset).unwrap();
            let _ = filter.filter(&data);
            let _ = filter.finish();
        }
    }

    #[test]
    fn big5_text_round_trips(s in "[a-z 繁體中文]{0,32}") {
        let (encoded, _, unmappable) = BIG5.encode(&s);
        prop_assert!(!unmappable);
        prop_assert_eq!(&reassemble("BIG5", &encoded, &[]), &s);
    }
}
