//! Translation from printable characters (and `\n`) to QEMU monitor
//! `sendkey` tokens.
//!
//! Letters map to `shift-<lower>`; most punctuation maps to a documented
//! scancode, with the shifted variant for the character reached by holding
//! shift on a US keyboard. A character with no entry is passed through to
//! `sendkey` as-is, which lets callers use raw QEMU key names (`ctrl-alt-f1`,
//! `esc`, ...) alongside plain text.

/// Look up the monitor `sendkey` token for a single character.
pub fn char_to_key(c: char) -> String {
    for (ch, key) in TABLE {
        if *ch == c {
            return key.to_string();
        }
    }
    c.to_string()
}

const TABLE: &[(char, &str)] = &[
    ('A', "shift-a"),
    ('B', "shift-b"),
    ('C', "shift-c"),
    ('D', "shift-d"),
    ('E', "shift-e"),
    ('F', "shift-f"),
    ('G', "shift-g"),
    ('H', "shift-h"),
    ('I', "shift-i"),
    ('J', "shift-j"),
    ('K', "shift-k"),
    ('L', "shift-l"),
    ('M', "shift-m"),
    ('N', "shift-n"),
    ('O', "shift-o"),
    ('P', "shift-p"),
    ('Q', "shift-q"),
    ('R', "shift-r"),
    ('S', "shift-s"),
    ('T', "shift-t"),
    ('U', "shift-u"),
    ('V', "shift-v"),
    ('W', "shift-w"),
    ('X', "shift-x"),
    ('Y', "shift-y"),
    ('Z', "shift-z"),
    (' ', "spc"),
    ('\n', "ret"),
    ('-', "0x0C"),
    ('_', "shift-0x0C"),
    ('=', "0x0D"),
    ('+', "shift-0x0D"),
    ('[', "0x1A"),
    ('{', "shift-0x1A"),
    (']', "0x1B"),
    ('}', "shift-0x1B"),
    (';', "0x27"),
    (':', "shift-0x27"),
    ('\'', "0x28"),
    ('"', "shift-0x28"),
    ('`', "0x29"),
    ('~', "shift-0x29"),
    ('\\', "0x2B"),
    ('|', "shift-0x2B"),
    (',', "0x33"),
    ('<', "shift-0x33"),
    ('.', "0x34"),
    ('>', "shift-0x34"),
    ('/', "0x35"),
    ('?', "shift-0x35"),
    ('!', "shift-0x02"),
    ('@', "shift-0x03"),
    ('#', "shift-0x04"),
    ('$', "shift-0x05"),
    ('%', "shift-0x06"),
    ('^', "shift-0x07"),
    ('&', "shift-0x08"),
    ('*', "shift-0x09"),
    ('(', "shift-0x0A"),
    (')', "shift-0x0B"),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uppercase_letters_map_to_shifted_lowercase() {
        assert_eq!(char_to_key('A'), "shift-a");
        assert_eq!(char_to_key('Z'), "shift-z");
    }

    #[test]
    fn space_and_newline_have_dedicated_tokens() {
        assert_eq!(char_to_key(' '), "spc");
        assert_eq!(char_to_key('\n'), "ret");
    }

    #[test]
    fn shifted_punctuation_uses_documented_scancodes() {
        assert_eq!(char_to_key('!'), "shift-0x02");
        assert_eq!(char_to_key(')'), "shift-0x0B");
    }

    #[test]
    fn unmapped_characters_pass_through() {
        assert_eq!(char_to_key('a'), "a");
        assert_eq!(char_to_key('5'), "5");
    }
}
