//! Console command parsing

use crate::domain::models::{CharacteristicName, Intent};
use crate::infrastructure::bluetooth::protocol;
use thiserror::Error;

/// One line typed at the console
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Run(Intent),
    Status,
    Help,
    Quit,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Unknown command '{0}', type 'help'")]
    UnknownCommand(String),
    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),
    #[error(transparent)]
    UnknownCharacteristic(#[from] crate::error::UnknownCharacteristic),
    #[error("Invalid hex payload '{0}'")]
    InvalidHex(String),
    #[error("Expected 'on' or 'off', got '{0}'")]
    InvalidSwitch(String),
}

pub const HELP: &str = "\
Commands:
  start                    acquire the BLE adapter
  scan                     find the CapSense/LED peripheral
  connect                  connect to the peripheral found by scan
  discover                 discover services
  led on|off               switch the LED
  read <led|capsense>      read a characteristic
  write <name> <hex>       write raw bytes, e.g. 'write led 01'
  notify <name>            enable notifications
  disconnect               drop the link
  status                   show state and cached values
  help                     show this text
  quit                     disconnect and exit";

fn parse_hex(text: &str) -> Result<Vec<u8>, ParseError> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.is_empty() || !digits.is_ascii() || digits.len() % 2 != 0 {
        return Err(ParseError::InvalidHex(text.to_string()));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| ParseError::InvalidHex(text.to_string()))
        })
        .collect()
}

pub fn parse(line: &str) -> Result<Option<ConsoleCommand>, ParseError> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };

    let mut characteristic = || -> Result<CharacteristicName, ParseError> {
        Ok(words
            .next()
            .ok_or(ParseError::MissingArgument("characteristic"))?
            .parse()?)
    };

    let command = match verb.to_lowercase().as_str() {
        "start" => ConsoleCommand::Run(Intent::StartAdapter),
        "scan" => ConsoleCommand::Run(Intent::Scan),
        "connect" => ConsoleCommand::Run(Intent::Connect),
        "discover" => ConsoleCommand::Run(Intent::DiscoverServices),
        "disconnect" => ConsoleCommand::Run(Intent::Disconnect),
        "read" => ConsoleCommand::Run(Intent::ReadCharacteristic(characteristic()?)),
        "notify" => ConsoleCommand::Run(Intent::EnableNotifications(characteristic()?)),
        "write" => {
            let name = characteristic()?;
            let rest = words.collect::<Vec<_>>().join("");
            if rest.is_empty() {
                return Err(ParseError::MissingArgument("payload"));
            }
            ConsoleCommand::Run(Intent::WriteCharacteristic(name, parse_hex(&rest)?))
        }
        "led" => {
            let on = match words.next().map(str::to_lowercase).as_deref() {
                Some("on") | Some("1") => true,
                Some("off") | Some("0") => false,
                Some(other) => return Err(ParseError::InvalidSwitch(other.to_string())),
                None => return Err(ParseError::MissingArgument("on|off")),
            };
            ConsoleCommand::Run(Intent::WriteCharacteristic(
                CharacteristicName::Led,
                protocol::encode_led(on).to_vec(),
            ))
        }
        "status" => ConsoleCommand::Status,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => return Err(ParseError::UnknownCommand(other.to_string())),
    };
    Ok(Some(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_commands() {
        assert_eq!(parse("scan"), Ok(Some(ConsoleCommand::Run(Intent::Scan))));
        assert_eq!(
            parse("  Discover "),
            Ok(Some(ConsoleCommand::Run(Intent::DiscoverServices)))
        );
        assert_eq!(parse(""), Ok(None));
        assert_eq!(parse("exit"), Ok(Some(ConsoleCommand::Quit)));
    }

    #[test]
    fn test_led_switch() {
        assert_eq!(
            parse("led on"),
            Ok(Some(ConsoleCommand::Run(Intent::WriteCharacteristic(
                CharacteristicName::Led,
                vec![0x01]
            ))))
        );
        assert_eq!(parse("led maybe"), Err(ParseError::InvalidSwitch("maybe".into())));
        assert_eq!(parse("led"), Err(ParseError::MissingArgument("on|off")));
    }

    #[test]
    fn test_characteristic_arguments() {
        assert_eq!(
            parse("read capsense"),
            Ok(Some(ConsoleCommand::Run(Intent::ReadCharacteristic(
                CharacteristicName::CapSense
            ))))
        );
        assert_eq!(
            parse("write led 00"),
            Ok(Some(ConsoleCommand::Run(Intent::WriteCharacteristic(
                CharacteristicName::Led,
                vec![0x00]
            ))))
        );
        assert!(matches!(
            parse("read buzzer"),
            Err(ParseError::UnknownCharacteristic(_))
        ));
        assert_eq!(parse("write led 0"), Err(ParseError::InvalidHex("0".into())));
        assert_eq!(parse("write led"), Err(ParseError::MissingArgument("payload")));
    }
}
