//! Recovery of text that was decoded with the wrong 8-bit code page.
//!
//! Chat exports and model output frequently arrive as UTF-8 that was read as
//! Latin-1 or Windows-1252 somewhere upstream ("NÃ£o" instead of "Não").
//! [`recover`] reverses a single layer of that damage and is a no-op on text
//! that is already correct.

use std::sync::LazyLock;

use regex::Regex;

/// Windows-1252 glyphs for bytes 0x80..=0x9F. The five undefined slots map to
/// the matching C1 control, which is what lenient decoders produce.
const CP1252_HIGH: [char; 32] = [
    '€', '\u{81}', '‚', 'ƒ', '„', '…', '†', '‡', 'ˆ', '‰', 'Š', '‹', 'Œ', '\u{8d}', 'Ž', '\u{8f}',
    '\u{90}', '‘', '’', '“', '”', '•', '–', '—', '˜', '™', 'š', '›', 'œ', '\u{9d}', 'ž', 'Ÿ',
];

/// Characters whose mis-decoded form is common enough in Portuguese and
/// English chat logs to be worth a table entry.
const KNOWN_CHARS: &str = "áàâãäçéèêëíìîïñóòôõöúùûüÁÀÂÃÇÉÈÊÍÓÔÕÚÜºª’‘“”–—…€•°";

static KNOWN_SEQUENCES: LazyLock<Vec<(String, char)>> = LazyLock::new(|| {
    let mut table = Vec::new();
    for c in KNOWN_CHARS.chars() {
        let mut buf = [0u8; 4];
        let bytes = c.encode_utf8(&mut buf).as_bytes();
        let as_cp1252: String = bytes.iter().map(|&b| cp1252_char(b)).collect();
        let as_latin1: String = bytes.iter().map(|&b| b as char).collect();
        table.push((as_cp1252.clone(), c));
        if as_latin1 != as_cp1252 {
            table.push((as_latin1, c));
        }
    }
    // Longest first so three-byte sequences win over their two-byte prefixes.
    table.sort_by(|a, b| b.0.chars().count().cmp(&a.0.chars().count()));
    table
});

/// Leading bytes of a four-byte emoji whose tail was cut off.
static EMOJI_FRAGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"ðŸ[\x{80}-\x{BF}€‚ƒ„…†‡ˆ‰Š‹ŒŽ‘’“”•–—˜™š›œžŸ]{0,2}").expect("static regex")
});

/// Marker bytes left behind once a table repair has shown the text is damaged.
static STRAY_MARKERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ð$|[\x{FFFD}\x{80}-\x{9F}]").expect("static regex"));

fn cp1252_char(b: u8) -> char {
    if (0x80..=0x9F).contains(&b) {
        CP1252_HIGH[(b - 0x80) as usize]
    } else {
        b as char
    }
}

fn latin1_byte(c: char) -> Option<u8> {
    u8::try_from(u32::from(c)).ok()
}

fn cp1252_byte(c: char) -> Option<u8> {
    let cp = u32::from(c);
    if cp < 0x80 || (0xA0..=0xFF).contains(&cp) {
        return Some(cp as u8);
    }
    CP1252_HIGH
        .iter()
        .position(|&h| h == c)
        .map(|i| 0x80 + i as u8)
}

/// Re-encode every char through `to_byte` and decode the bytes as UTF-8.
fn redecode(text: &str, to_byte: fn(char) -> Option<u8>) -> Option<String> {
    let bytes = text.chars().map(to_byte).collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}

/// Reverse one layer of mis-decoding.
///
/// Tries a whole-string Latin-1 round trip, then Windows-1252, accepting the
/// first that yields valid UTF-8. Text with mixed damage falls through to a
/// table of known sequences. Cut-off emoji prefixes are always dropped; other
/// marker bytes only when the table found damage.
pub fn recover(text: &str) -> String {
    if text.is_ascii() {
        return text.to_string();
    }

    for to_byte in [latin1_byte as fn(char) -> Option<u8>, cp1252_byte] {
        if let Some(fixed) = redecode(text, to_byte) {
            if fixed != text {
                return fixed;
            }
        }
    }

    let mut fixed = text.to_string();
    let mut damaged = false;
    for (broken, good) in KNOWN_SEQUENCES.iter() {
        if fixed.contains(broken.as_str()) {
            fixed = fixed.replace(broken.as_str(), good.encode_utf8(&mut [0u8; 4]));
            damaged = true;
        }
    }
    let fixed = EMOJI_FRAGMENT.replace_all(&fixed, "").into_owned();
    if damaged {
        STRAY_MARKERS.replace_all(&fixed, "").into_owned()
    } else {
        fixed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latin1_mojibake_is_reversed() {
        assert_eq!(recover("NÃ£o Ã© fÃ¡cil"), "Não é fácil");
    }

    #[test]
    fn cp1252_mojibake_is_reversed() {
        assert_eq!(recover("itâ€™s fine"), "it’s fine");
        assert_eq!(recover("â€œolÃ¡â€\u{9d}"), "“olá”");
    }

    #[test]
    fn mixed_damage_uses_the_table() {
        assert_eq!(recover("Não Ã© assim"), "Não é assim");
    }

    #[test]
    fn truncated_emoji_marker_is_stripped() {
        assert_eq!(recover("Nao Ã©?ð"), "Nao é?");
        assert_eq!(recover("olá ðŸ˜"), "olá ");
    }

    #[test]
    fn correct_text_is_untouched() {
        for text in ["plain ascii", "Não é fácil", "coração", "it’s “quoted”"] {
            assert_eq!(recover(text), text);
        }
    }

    #[test]
    fn trailing_eth_and_replacement_chars_survive_in_clean_text() {
        for text in [
            "Vou a Reykjavík com a með",
            "Ísland og Færeyjar: ð",
            "sinal \u{FFFD} perdido",
        ] {
            assert_eq!(recover(text), text);
        }
    }

    #[test]
    fn recovery_is_idempotent() {
        for text in ["NÃ£o Ã© fÃ¡cil", "itâ€™s", "Não Ã© assim", "Nao Ã©?ð"] {
            let once = recover(text);
            assert_eq!(recover(&once), once);
        }
    }
}
