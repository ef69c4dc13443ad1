//! Drives a simulated milk meter end to end: scan, connect, discover, read
//! notifications and write to both services.

use gattlink::gap::{AdvertisingReport, ADV_IND};
use gattlink::gatt::router::{BCP_NOTIFY, BCP_WRITE_PREFIX, MMP_NOTIFY};
use gattlink::transport::sim::{milk_meter_profile, SimTransport};
use gattlink::{BdAddr, Client, ClientConfig, DeviceIdentity, Scanner};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    gattlink::logging::init(None)?;

    let address: BdAddr = "AA:BB:CC:DD:EE:FF".parse()?;
    let sim = Arc::new(SimTransport::new());
    sim.add_peripheral(address, milk_meter_profile());
    sim.advertise(AdvertisingReport {
        address,
        event_type: ADV_IND,
        rssi: -48,
        data: vec![0x06, 0x09, b'M', b'e', b't', b'e', b'r'],
    });

    println!("Scanning for {}...", address);
    let scanner = Scanner::new(sim.clone());
    for device in scanner.scan_ms(&["AA:BB:CC:DD:EE:FF"], 2000)? {
        println!(
            "Device found: {} (RSSI: {}) name {:?}",
            device.identity,
            device.rssi,
            device.local_name
        );
    }

    let config = ClientConfig::milk_meter(DeviceIdentity::new(address))
        .with_read_timeout(Duration::from_millis(500));
    let client = Client::new(config, sim.clone())?;
    client.connect()?;
    print!("{}", client.discover_services()?);

    // The meter answers from its own radio thread
    let radio = {
        let sim = sim.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            sim.notify(address, MMP_NOTIFY, &[0x01, 0x02]);
            sim.notify(address, BCP_NOTIFY, &[0x03]);
        })
    };

    let first = client.read(2)?;
    println!("read(2): {}", hex::encode(&first));
    radio.join().map_err(|_| "radio thread panicked")?;
    println!("read_all(): {}", hex::encode(client.read_all()?));

    client.write(&[0x6e])?;
    let mut frame = BCP_WRITE_PREFIX.to_vec();
    frame.push(0x01);
    client.write(&frame)?;
    for (characteristic, data) in sim.writes(address) {
        println!("wrote {} to {}", hex::encode(data), characteristic);
    }

    client.close()?;
    println!("Connected after close: {}", client.is_connected());
    Ok(())
}
