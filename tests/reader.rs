mod common;

mod reader {
    use crate::common::{self, FakeBoard, MockRadio, inbound};
    use pretty_assertions::assert_eq;
    use proximity_tag::config::{Configuration, DOWNLOAD_CHANNEL, READER_CHANNEL};
    use proximity_tag::error::Error;
    use proximity_tag::protocol::{DataRecord, Opcode, Packet, Setting, SettingsReport};
    use proximity_tag::reader::Reader;

    type TestReader = Reader<MockRadio, FakeBoard>;

    fn reader() -> TestReader {
        Reader::new(MockRadio::new(), FakeBoard::new())
    }

    fn record(tag_id: u16) -> DataRecord {
        DataRecord {
            tag_id,
            first_seen: 10,
            last_seen: 20,
            now: 30,
        }
    }

    fn ack(tag_id: u16) -> Packet {
        Packet::ack(tag_id, None)
    }

    #[test]
    fn discovers_the_closest_device() {
        let mut reader = reader();
        reader.radio_mut().reply(vec![inbound(
            READER_CHANNEL,
            &Packet::ping(7, true),
            false,
        )]);
        reader.radio_mut().reply(vec![inbound(
            READER_CHANNEL,
            &Packet::ping(9, true),
            true,
        )]);

        assert_eq!(reader.discover(), Ok(9));

        let sent = &reader.radio_mut().sent;
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|sent| sent.channel == READER_CHANNEL));
        assert_eq!(sent[0].bytes, vec![0xA1, 0x00, 0x00]);
    }

    #[test]
    fn discovery_gives_up() {
        let mut reader = reader();
        assert_eq!(reader.discover(), Err(Error::NoDeviceFound));
        assert!(reader.radio_mut().count(Opcode::Ping) > 100);
    }

    #[test]
    fn start_returns_battery_level() {
        let mut reader = reader();
        reader.radio_mut().reply(vec![inbound(
            DOWNLOAD_CHANNEL,
            &Packet::ack(common::TAG_ID, Some(99)),
            true,
        )]);

        assert_eq!(reader.start(common::TAG_ID), Ok(99));

        let sent = &reader.radio_mut().sent;
        assert_eq!(sent[0].channel, DOWNLOAD_CHANNEL);
        assert_eq!(sent[0].bytes, vec![0xA3, 0x00, 0x42]);
    }

    #[test]
    fn silent_device_is_unreachable() {
        let mut reader = reader();
        assert_eq!(reader.stop(common::TAG_ID), Err(Error::Unreachable));
    }

    #[test]
    fn commands_expect_an_ack() {
        let mut reader = reader();
        reader.radio_mut().reply(vec![inbound(
            DOWNLOAD_CHANNEL,
            &Packet::data_record(&record(1)),
            true,
        )]);

        assert_eq!(
            reader.reset(common::TAG_ID),
            Err(Error::UnexpectedResponse(0xA9))
        );
    }

    #[test]
    fn writes_settings() {
        let mut reader = reader();
        reader
            .radio_mut()
            .reply(vec![inbound(DOWNLOAD_CHANNEL, &ack(common::TAG_ID), true)]);

        reader
            .write_setting(common::TAG_ID, &Setting::PingPeriodMs(500))
            .unwrap();

        assert_eq!(
            reader.radio_mut().sent[0].bytes,
            vec![0xAA, 0x00, 0x42, 0x04, 0x01, 0xF4]
        );
    }

    #[test]
    fn reads_settings() {
        let mut reader = reader();
        let mut config = Configuration::default();
        config.session_timeout_secs = 300;
        let report = SettingsReport {
            battery: 10,
            config,
        };
        reader.radio_mut().reply(vec![inbound(
            DOWNLOAD_CHANNEL,
            &Packet::settings_report(&report),
            true,
        )]);

        assert_eq!(reader.read_settings(common::TAG_ID), Ok(report));
    }

    #[test]
    fn downloads_until_ack() {
        let mut reader = reader();
        reader.radio_mut().reply(vec![
            inbound(DOWNLOAD_CHANNEL, &Packet::data_record(&record(1)), true),
            inbound(DOWNLOAD_CHANNEL, &Packet::data_record(&record(2)), true),
            inbound(DOWNLOAD_CHANNEL, &ack(common::TAG_ID), true),
        ]);

        let mut records = Vec::new();
        let count = reader
            .download(common::TAG_ID, false, |record| records.push(record))
            .unwrap();

        assert_eq!(count, 2);
        assert_eq!(records, vec![record(1), record(2)]);
        assert!(reader.radio_mut().sent[0].is(Opcode::Download));
    }

    #[test]
    fn stalled_download_fails() {
        let mut reader = reader();
        reader.radio_mut().reply(vec![inbound(
            DOWNLOAD_CHANNEL,
            &Packet::data_record(&record(1)),
            true,
        )]);

        let mut records = Vec::new();
        assert_eq!(
            reader.download(common::TAG_ID, true, |record| records.push(record)),
            Err(Error::Unreachable)
        );
        assert_eq!(records.len(), 1);
        assert!(reader.radio_mut().sent[0].is(Opcode::DownloadAndReset));
    }

    #[test]
    fn harvests_devices_coming_close() {
        let mut reader = reader();
        reader.radio_mut().reply(vec![
            inbound(READER_CHANNEL, &Packet::ping(common::TAG_ID, true), true),
            inbound(READER_CHANNEL, &Packet::ping(common::TAG_ID, true), true),
        ]);
        reader.radio_mut().reply(vec![
            inbound(DOWNLOAD_CHANNEL, &Packet::data_record(&record(5)), true),
            inbound(DOWNLOAD_CHANNEL, &ack(common::TAG_ID), true),
        ]);

        let mut records = Vec::new();
        let harvested = reader.harvest(|record| records.push(record)).unwrap();

        assert_eq!(harvested, Some((common::TAG_ID, 1)));
        assert_eq!(records, vec![record(5)]);

        let sent = &reader.radio_mut().sent;
        assert!(sent[1].is(Opcode::DownloadAndReset));
        assert_eq!(sent[1].channel, DOWNLOAD_CHANNEL);
    }

    #[test]
    fn harvest_without_devices() {
        let mut reader = reader();
        assert_eq!(reader.harvest(|_| {}), Ok(None));
    }
}
