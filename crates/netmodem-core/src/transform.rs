//! Byte transform pipeline
//!
//! Two filters run over connection data before it reaches the terminal:
//! a mask-out set that drops bytes, and a small programmable substitution
//! machine. Both exist once globally and once per connection; the global
//! copy always runs first.
//!
//! ## Substitution programs
//!
//! A program is typed as a string of seven-character rules:
//!
//! ```text
//!   MM A BC NN
//!   |  | |  +-- next rule index (hex)
//!   |  | +----- two more actions, or the replacement byte (hex) when A is 'r'
//!   |  +------- first action
//!   +---------- byte to match (hex), 00 matches anything
//! ```
//!
//! Actions: `e`/`-` nothing, `p` hold the byte, `d` emit the byte,
//! `q` emit the held bytes, `x` discard the held bytes, `r` emit the
//! replacement byte.
//!
//! Matching starts at the cursor rule and walks forward; a byte that no rule
//! from the cursor to the end of the program matches is dropped and the
//! cursor returns to rule 0.

use serde::{Deserialize, Serialize};

use crate::protocol::ProgramError;

/// Characters per substitution rule
pub const RULE_WIDTH: usize = 7;

/// Upper bound on bytes held by a substitution cursor
pub const MAX_HELD: usize = 256;

/// An ordered set of byte values (mask-outs or delimiters)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteSet(Vec<u8>);

impl ByteSet {
    /// Build a set from raw bytes, keeping first-seen order
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut set = Self::default();
        for &b in bytes {
            set.insert(b);
        }
        set
    }

    /// Add a byte
    pub fn insert(&mut self, b: u8) {
        if !self.0.contains(&b) {
            self.0.push(b);
        }
    }

    pub fn contains(&self, b: u8) -> bool {
        self.0.contains(&b)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Drop every masked byte from `data`
    pub fn mask_out(&self, data: &mut Vec<u8>) {
        if !self.0.is_empty() {
            data.retain(|b| !self.0.contains(b));
        }
    }
}

/// One step of a substitution rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// `e` or `-`
    Nothing,
    /// `p`: push the byte onto the held queue
    Hold,
    /// `d`: emit the byte
    Emit,
    /// `q`: emit and clear the held queue
    Flush,
    /// `x`: clear the held queue
    Discard,
}

impl Action {
    fn from_char(c: char) -> Option<Self> {
        match c {
            'e' | '-' => Some(Self::Nothing),
            'p' => Some(Self::Hold),
            'd' => Some(Self::Emit),
            'q' => Some(Self::Flush),
            'x' => Some(Self::Discard),
            _ => None,
        }
    }

    fn to_char(self) -> char {
        match self {
            Self::Nothing => '-',
            Self::Hold => 'p',
            Self::Emit => 'd',
            Self::Flush => 'q',
            Self::Discard => 'x',
        }
    }
}

/// What a rule does once it matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleActions {
    /// Emit a fixed byte instead of the matched one
    Replace(u8),
    /// Run up to three actions in order
    Sequence([Action; 3]),
}

/// A decoded substitution rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Byte to match, `None` for the wildcard
    pub matcher: Option<u8>,
    pub actions: RuleActions,
    /// Rule the cursor moves to after a match
    pub next: u8,
}

impl Rule {
    fn matches(&self, b: u8) -> bool {
        self.matcher.map_or(true, |m| m == b)
    }
}

/// A validated substitution program
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    rules: Vec<Rule>,
}

fn hex_pair(hi: u8, lo: u8) -> Option<u8> {
    let digit = |c: u8| (c as char).to_digit(16);
    Some((digit(hi)? * 16 + digit(lo)?) as u8)
}

impl Program {
    /// Decode and validate program text
    pub fn parse(text: &[u8]) -> Result<Self, ProgramError> {
        if text.len() % RULE_WIDTH != 0 {
            return Err(ProgramError::BadLength(text.len()));
        }
        let mut rules = Vec::with_capacity(text.len() / RULE_WIDTH);
        for (rule, chunk) in text.chunks(RULE_WIDTH).enumerate() {
            let matcher = hex_pair(chunk[0], chunk[1]).ok_or(ProgramError::BadMatch { rule })?;
            let first = (chunk[2] as char).to_ascii_lowercase();
            let actions = if first == 'r' {
                let with = hex_pair(chunk[3], chunk[4]).ok_or(ProgramError::BadReplacement { rule })?;
                RuleActions::Replace(with)
            } else {
                let mut seq = [Action::Nothing; 3];
                for (slot, &c) in chunk[2..5].iter().enumerate() {
                    let c = (c as char).to_ascii_lowercase();
                    // '-' is only a placeholder for the second and third slots
                    if slot == 0 && c == '-' {
                        return Err(ProgramError::BadAction { rule, action: c });
                    }
                    seq[slot] = Action::from_char(c).ok_or(ProgramError::BadAction { rule, action: c })?;
                }
                RuleActions::Sequence(seq)
            };
            let next = hex_pair(chunk[5], chunk[6]).ok_or(ProgramError::BadNext { rule })?;
            rules.push(Rule {
                matcher: if matcher == 0 { None } else { Some(matcher) },
                actions,
                next,
            });
        }
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Re-encode the program in its typed form
    pub fn to_text(&self) -> String {
        let mut out = String::with_capacity(self.rules.len() * RULE_WIDTH);
        for rule in &self.rules {
            out.push_str(&format!("{:02x}", rule.matcher.unwrap_or(0)));
            match rule.actions {
                RuleActions::Replace(b) => out.push_str(&format!("r{:02x}", b)),
                RuleActions::Sequence(seq) => seq.iter().for_each(|a| out.push(a.to_char())),
            }
            out.push_str(&format!("{:02x}", rule.next));
        }
        out
    }
}

/// Live matching state of a program
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cursor {
    /// Current rule; at or past the end the machine is idle
    pub rule: usize,
    /// Bytes held by `p` actions
    pub held: Vec<u8>,
}

impl Cursor {
    pub fn reset(&mut self) {
        self.rule = 0;
        self.held.clear();
    }
}

/// A program together with its cursor
#[derive(Debug, Clone, Default)]
pub struct Substitution {
    program: Program,
    cursor: Cursor,
}

impl Substitution {
    pub fn new(program: Program) -> Self {
        Self {
            program,
            cursor: Cursor::default(),
        }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Replace the program and rewind the cursor
    pub fn set_program(&mut self, program: Program) {
        self.program = program;
        self.cursor.reset();
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    /// Swap in a saved cursor, returning the live one
    pub fn replace_cursor(&mut self, cursor: Cursor) -> Cursor {
        std::mem::replace(&mut self.cursor, cursor)
    }

    pub fn reset(&mut self) {
        self.cursor.reset();
    }

    /// Move the cursor forward `n` rules without matching anything
    pub fn advance(&mut self, n: usize) {
        for _ in 0..n {
            if self.cursor.rule < self.program.len() {
                self.cursor.rule += 1;
            }
        }
    }

    /// True if bytes are waiting in the held queue
    pub fn has_held(&self) -> bool {
        !self.cursor.held.is_empty()
    }

    /// Run `input` through the machine
    pub fn apply(&mut self, input: &[u8]) -> Vec<u8> {
        let rules = &self.program.rules;
        if rules.is_empty() || self.cursor.rule >= rules.len() {
            return input.to_vec();
        }
        let cursor = &mut self.cursor;
        let mut out = Vec::with_capacity(input.len());
        let mut i = 0;
        while i < input.len() {
            let rule = rules[cursor.rule];
            if rule.matches(input[i]) {
                let c = input[i];
                i += 1;
                match rule.actions {
                    RuleActions::Replace(with) => out.push(with),
                    RuleActions::Sequence(seq) => {
                        for action in seq {
                            match action {
                                Action::Nothing => {}
                                Action::Hold => {
                                    if cursor.held.len() < MAX_HELD {
                                        cursor.held.push(c);
                                    }
                                }
                                Action::Emit => out.push(c),
                                Action::Flush => out.append(&mut cursor.held),
                                Action::Discard => cursor.held.clear(),
                            }
                        }
                    }
                }
                if (rule.next as usize) < rules.len() {
                    cursor.rule = rule.next as usize;
                }
            } else {
                cursor.rule += 1;
                if cursor.rule >= rules.len() {
                    cursor.rule = 0;
                    i += 1;
                }
            }
        }
        out
    }
}

/// Delimiter, mask and substitution settings of one scope
#[derive(Debug, Clone, Default)]
pub struct TransformSet {
    pub delimiters: ByteSet,
    pub masks: ByteSet,
    pub substitution: Substitution,
}

/// Edits typed on the current command line, not yet committed
#[derive(Debug, Clone, Default)]
pub struct StagedTransforms {
    pub delimiters: Option<ByteSet>,
    pub masks: Option<ByteSet>,
    pub program: Option<Program>,
}

impl StagedTransforms {
    pub fn is_empty(&self) -> bool {
        self.delimiters.is_none() && self.masks.is_none() && self.program.is_none()
    }

    /// Move the staged edits into `target`, leaving nothing staged
    pub fn commit_into(&mut self, target: &mut TransformSet) {
        if let Some(d) = self.delimiters.take() {
            target.delimiters = d;
        }
        if let Some(m) = self.masks.take() {
            target.masks = m;
        }
        if let Some(p) = self.program.take() {
            target.substitution.set_program(p);
        }
    }

    /// Hand the staged edits to a new or newly selected connection.
    ///
    /// Unlike a commit, unstaged fields are cleared on the target.
    pub fn assign_into(&mut self, target: &mut TransformSet) {
        target.delimiters = self.delimiters.take().unwrap_or_default();
        target.masks = self.masks.take().unwrap_or_default();
        target.substitution.set_program(self.program.take().unwrap_or_default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_mask_out_drops_bytes() {
        let masks = ByteSet::from_bytes(&[b'\n', 0]);
        let mut data = b"a\nb\0c".to_vec();
        masks.mask_out(&mut data);
        assert_eq!(data, b"abc".to_vec());
    }

    #[test]
    fn test_mask_out_idempotent() {
        let masks = ByteSet::from_bytes(b"xy");
        let mut once = b"xaybxc".to_vec();
        masks.mask_out(&mut once);
        let mut twice = once.clone();
        masks.mask_out(&mut twice);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_parse_rejects_bad_length() {
        assert_eq!(Program::parse(b"0dd-"), Err(ProgramError::BadLength(4)));
    }

    #[test]
    fn test_parse_rejects_bad_action() {
        assert_eq!(
            Program::parse(b"41z--00"),
            Err(ProgramError::BadAction { rule: 0, action: 'z' })
        );
    }

    #[test]
    fn test_parse_replace_rule() {
        let program = Program::parse(b"0dr0a00").unwrap();
        assert_eq!(
            program.rules()[0],
            Rule {
                matcher: Some(0x0d),
                actions: RuleActions::Replace(0x0a),
                next: 0
            }
        );
        assert_eq!(program.to_text(), "0dr0a00");
    }

    #[test]
    fn test_replace_with_wildcard_fallback() {
        // CR becomes LF, anything else passes through
        let program = Program::parse(b"0dr0a0000d--00").unwrap();
        let mut sub = Substitution::new(program);
        assert_eq!(sub.apply(b"a\rb"), b"a\nb".to_vec());
    }

    #[test]
    fn test_unmatched_byte_is_dropped() {
        let program = Program::parse(b"41d--00").unwrap();
        let mut sub = Substitution::new(program);
        assert_eq!(sub.apply(b"ABA"), b"AA".to_vec());
        assert_eq!(sub.cursor().rule, 0);
    }

    #[test]
    fn test_hold_and_flush() {
        // Hold bytes after ESC until 'm', then emit them; 'x' discards
        let program = Program::parse(b"1bp--0100p--01").unwrap();
        let mut sub = Substitution::new(program);
        let out = sub.apply(&[0x1b, b'[', b'1']);
        assert!(out.is_empty());
        assert_eq!(sub.cursor().held, vec![0x1b, b'[', b'1']);

        let program = Program::parse(b"1bp--0100p--0100q--00").unwrap();
        let mut sub = Substitution::new(program);
        let out = sub.apply(&[0x1b, b'x']);
        assert!(out.is_empty());
        assert!(sub.has_held());
    }

    #[test]
    fn test_flush_emits_held_bytes() {
        // rule 0: hold 'a' -> rule 1; rule 1: on 'b' flush held, emit 'b' -> rule 0
        let program = Program::parse(b"61p--0162qd-00").unwrap();
        let mut sub = Substitution::new(program);
        assert_eq!(sub.apply(b"ab"), b"ab".to_vec());
        assert!(!sub.has_held());
    }

    #[test]
    fn test_discard_held_bytes() {
        let program = Program::parse(b"61p--0162x--00").unwrap();
        let mut sub = Substitution::new(program);
        assert_eq!(sub.apply(b"ab"), Vec::<u8>::new());
        assert!(!sub.has_held());
    }

    #[test]
    fn test_advance_past_end_disables() {
        let program = Program::parse(b"41d--00").unwrap();
        let mut sub = Substitution::new(program);
        sub.advance(5);
        assert_eq!(sub.cursor().rule, 1);
        assert_eq!(sub.apply(b"xyz"), b"xyz".to_vec());
        sub.reset();
        assert_eq!(sub.apply(b"xyz"), Vec::<u8>::new());
    }

    #[test]
    fn test_staged_commit_keeps_unstaged_fields() {
        let mut target = TransformSet::default();
        target.masks = ByteSet::from_bytes(b"q");
        let mut staged = StagedTransforms {
            delimiters: Some(ByteSet::from_bytes(b"\r")),
            ..Default::default()
        };
        staged.commit_into(&mut target);
        assert!(staged.is_empty());
        assert!(target.delimiters.contains(b'\r'));
        assert!(target.masks.contains(b'q'));
    }
}
