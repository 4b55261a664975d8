//! End-to-end tests driving a session through its serial line

#[cfg(test)]
mod tests {
    use netmodem_core::flow::{FlowControlMode, XON};
    use netmodem_core::modem::{Collaborators, Mode, Session};
    use netmodem_core::ports::memory::*;
    use netmodem_core::protocol::{crc8, GUARD_TIME_MS};
    use pretty_assertions::assert_eq;
    use std::rc::Rc;

    struct Rig {
        session: Session,
        serial: MemorySerial,
        network: MemoryNetwork,
        clock: ManualClock,
    }

    impl Rig {
        /// Type one line and return everything the modem printed
        fn type_line(&mut self, line: &str) -> String {
            self.serial.push_input(line.as_bytes());
            self.serial.push_input(b"\r");
            self.session.step();
            self.serial.take_text()
        }

        fn steps(&mut self, n: usize) -> String {
            for _ in 0..n {
                self.session.step();
            }
            self.serial.take_text()
        }
    }

    fn rig() -> Rig {
        let serial = MemorySerial::new();
        let network = MemoryNetwork::new();
        let clock = ManualClock::new();
        let ports = Collaborators {
            network: Box::new(network.clone()),
            platform: Box::new(MemoryPlatform::new()),
            time: Box::new(MemoryTimeService::default()),
            printer: Box::new(MemoryPrinter::new()),
            fetcher: Box::new(MemoryWebFetcher::new()),
            store: Box::new(MemoryConfigStore::new()),
            phonebook: Box::new(MemoryPhoneBook::new()),
        };
        let mut session = Session::new(Box::new(serial.clone()), Rc::new(clock.clone()), ports);
        session.boot();
        serial.take_output();
        let mut rig = Rig {
            session,
            serial,
            network,
            clock,
        };
        rig.type_line("ATE0");
        rig
    }

    /// `(channel, length)` of every packet header in `text`
    fn headers(text: &str) -> Vec<(u32, usize)> {
        text.split("[ ")
            .skip(1)
            .filter_map(|rest| {
                let inner = &rest[..rest.find(" ]")?];
                let mut fields = inner.split_whitespace();
                let channel = fields.next()?.parse().ok()?;
                let len = fields.next()?.parse().ok()?;
                Some((channel, len))
            })
            .collect()
    }

    #[test]
    fn test_reset_and_numeric_responses() {
        let mut r = rig();
        assert_eq!(r.type_line("ATZ"), "\r\nOK\r\n");
        assert!(r.type_line("ATE0V0").ends_with("\r\n0\r\n"));
        assert_eq!(r.type_line("ATK"), "\r\n4\r\n");
    }

    #[test]
    fn test_first_error_stops_the_line() {
        let mut r = rig();
        assert_eq!(r.type_line("ATS0=3&Y\"zz\"S0=5"), "\r\nERROR\r\n");
        assert_eq!(r.session.settings().rings, 3);
    }

    #[test]
    fn test_invalid_program_keeps_previous() {
        let mut r = rig();
        assert_eq!(r.type_line("AT&Y\"41r4200\""), "\r\nOK\r\n");
        assert_eq!(r.session.global_transforms().substitution.program().len(), 1);
        assert_eq!(r.type_line("AT&Y\"4\""), "\r\nERROR\r\n");
        assert_eq!(r.session.global_transforms().substitution.program().len(), 1);
    }

    #[test]
    fn test_dial_streams_both_ways() {
        let mut r = rig();
        let remote = r.network.expect_connect("bbs.example.com", 23);
        assert_eq!(r.type_line("ATD\"bbs.example.com\""), "\r\nCONNECT 1\r\n");
        assert_eq!(r.session.mode(), Mode::Stream(1));
        assert_eq!(r.session.current(), Some(1));

        r.serial.push_input(b"hello");
        remote.push(b"welcome");
        assert_eq!(r.steps(1), "welcome");
        assert_eq!(remote.take_written(), b"hello".to_vec());
    }

    #[test]
    fn test_failed_dial_is_no_answer() {
        let mut r = rig();
        assert_eq!(r.type_line("ATD\"nowhere:6400\""), "\r\nNO ANSWER\r\n");
        assert_eq!(r.session.mode(), Mode::Command);
        assert_eq!(r.session.current(), None);
    }

    #[test]
    fn test_escape_then_resume() {
        let mut r = rig();
        let remote = r.network.expect_connect("bbs", 23);
        r.type_line("ATD\"bbs\"");
        r.clock.advance(GUARD_TIME_MS + 1);
        r.serial.push_input(b"+++");
        r.session.step();
        r.clock.advance(GUARD_TIME_MS + 1);
        assert_eq!(r.steps(1), "\r\nOK\r\n");
        assert_eq!(r.session.mode(), Mode::Command);
        assert!(remote.connected());

        assert_eq!(r.type_line("ATO"), "\r\nOK\r\n");
        assert_eq!(r.session.mode(), Mode::Stream(1));
    }

    #[test]
    fn test_packets_interleave_fairly() {
        let mut r = rig();
        let a = r.network.expect_connect("a", 23);
        let b = r.network.expect_connect("b", 23);
        assert_eq!(r.type_line("ATC\"a\""), "\r\nCONNECT 1\r\n");
        assert_eq!(r.type_line("ATC\"b\""), "\r\nCONNECT 2\r\n");
        assert_eq!(r.type_line("ATS40=4"), "\r\nOK\r\n");
        a.push(b"aaaaaaaa");
        b.push(b"bbbbbbbb");
        let text = r.steps(4);
        assert_eq!(headers(&text), vec![(1, 4), (2, 4), (1, 4), (2, 4)]);
        assert!(text.starts_with(&format!("[ 1 4 {} ]\r\naaaa", crc8(b"aaaa"))));
    }

    #[test]
    fn test_large_payloads_split_by_packet_size() {
        let mut r = rig();
        let a = r.network.expect_connect("a", 23);
        let b = r.network.expect_connect("b", 23);
        r.type_line("ATC\"a\"");
        r.type_line("ATC\"b\"");
        r.type_line("ATS40=40");
        a.push(&[b'A'; 50]);
        b.push(&[b'B'; 50]);
        let text = r.steps(4);
        assert_eq!(headers(&text), vec![(1, 40), (2, 40), (1, 10), (2, 10)]);
    }

    #[test]
    fn test_manual_flow_waits_for_xon() {
        let mut r = rig();
        let a = r.network.expect_connect("a", 23);
        r.type_line("ATC\"a\"");
        assert_eq!(r.type_line("ATF3"), "\r\nOK\r\n");
        assert_eq!(r.session.flow().mode(), FlowControlMode::Manual);

        a.push(b"data");
        assert_eq!(r.steps(2), "");
        r.serial.push_input(&[XON]);
        assert_eq!(r.steps(1), format!("[ 1 4 {} ]\r\ndata", crc8(b"data")));
        assert_eq!(r.steps(2), "");

        r.serial.push_input(&[XON]);
        assert_eq!(r.steps(1), "[ 0 0 0 ]\r\n");
    }

    #[test]
    fn test_incoming_call_answered_and_framed() {
        let mut r = rig();
        assert_eq!(r.type_line("ATS0=1A6400"), "\r\nOK\r\n");
        let caller = r.network.listener(6400).unwrap().ring("10.0.0.9");
        assert_eq!(r.steps(1), "\r\nRING\r\n\r\nCONNECT 2\r\n");
        caller.push(b"x");
        assert_eq!(r.steps(1), format!("[ 2 1 {} ]\r\nx", crc8(b"x")));
    }

    #[test]
    fn test_hangup_closes_everything() {
        let mut r = rig();
        let a = r.network.expect_connect("a", 23);
        r.type_line("ATC\"a\"");
        assert_eq!(r.type_line("ATH"), "\r\nOK\r\n");
        assert!(r.session.connection_ids().is_empty());
        assert!(!a.connected());
        assert_eq!(r.type_line("ATH0"), "\r\nERROR\r\n");
    }

    #[test]
    fn test_phonebook_entry_dials() {
        let mut r = rig();
        assert_eq!(r.type_line("ATP\"5551212=bbs:23,My BBS\""), "\r\nOK\r\n");
        assert_eq!(r.type_line("ATP"), "5551212         bbs:23\r\n\r\nOK\r\n");
        assert_eq!(r.type_line("ATP?"), "5551212         bbs:23 (My BBS)\r\n\r\nOK\r\n");
        r.network.expect_connect("bbs", 23);
        assert_eq!(r.type_line("ATD5551212"), "\r\nCONNECT 1\r\n");
        assert_eq!(r.session.mode(), Mode::Stream(1));
    }

    #[test]
    fn test_transmit_checks_crc() {
        let mut r = rig();
        let a = r.network.expect_connect("a", 23);
        r.type_line("ATC\"a\"");
        let crc = crc8(b"hello");
        assert_eq!(r.type_line(&format!("ATS42={}T\"hello\"", crc.wrapping_add(1))), "\r\nERROR\r\n");
        assert!(a.take_written().is_empty());
        assert_eq!(r.type_line(&format!("ATS42={}T\"hello\"", crc)), "\r\nOK\r\n");
        assert_eq!(a.take_written(), b"hello\r\n".to_vec());
    }

    #[test]
    fn test_transmit_needs_a_connection() {
        let mut r = rig();
        assert_eq!(r.type_line("ATT\"hello\""), "\r\nERROR\r\n");
    }

    #[test]
    fn test_transmit_huge_count_times_out() {
        let mut r = rig();
        let a = r.network.expect_connect("a", 23);
        r.type_line("ATC\"a\"");
        assert_eq!(r.type_line("ATT99999999999999999999"), "\r\nERROR\r\n");
        assert!(a.take_written().is_empty());
        assert_eq!(r.type_line("AT"), "\r\nOK\r\n");
    }

    #[test]
    fn test_transmit_raw_bytes() {
        let mut r = rig();
        let a = r.network.expect_connect("a", 23);
        r.type_line("ATC\"a\"");
        r.serial.push_input(b"ATT3\rabc");
        r.session.step();
        assert_eq!(r.serial.take_text(), "\r\nOK\r\n");
        assert_eq!(a.take_written(), b"abc".to_vec());
    }

    #[test]
    fn test_settings_survive_save_and_reset() {
        let mut r = rig();
        assert_eq!(r.type_line("ATS40=64&W"), "\r\nOK\r\n");
        assert_eq!(r.type_line("ATS40=10"), "\r\nOK\r\n");
        r.type_line("ATZ");
        assert_eq!(r.session.settings().packet_size, 64);
    }
}
