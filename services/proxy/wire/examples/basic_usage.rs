//! Basic usage example for the proxy wire envelope.

use proxy_wire::RawMessage;

#[derive(Clone, PartialEq, prost::Message)]
struct MeterReading {
    #[prost(string, tag = "1")]
    name: String,
    #[prost(double, tag = "2")]
    kwh: f64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Proxy Wire Envelope Example ===\n");

    // 1. Capture a message as opaque bytes
    let reading = MeterReading {
        name: "meter-3f-east".to_string(),
        kwh: 1234.5,
    };
    let envelope = RawMessage::from_message(&reading);
    println!("1. Captured {} bytes", envelope.len());

    // 2. Peek the routing key without decoding the rest
    let key = envelope.peek_string(1)?;
    println!("2. Routing key (field 1): {:?}", key);

    // 3. The bytes forwarded downstream are the bytes received
    let decoded: MeterReading = envelope.decode()?;
    println!("3. Downstream sees: {:?}", decoded);

    Ok(())
}
