// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use clap::{Parser, Subcommand};
use consts::{FLASH_APP_ADDRESS, FLASH_APP_SIZE, FLASH_META_ADDRESS, FLASH_META_RECORD_OFFSET, FLASH_META_SIZE, FLASH_WORD_SIZE};
use host_protocol::{
    checksum, image_record, EraseRequest, FrameDecoder, Inquiry, Request, Response, Status, VerifyRequest, WriteRequest, MAX_FRAME_SIZE,
};
use log::{debug, info};
use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);
/// Erasing the whole application region takes several seconds
const ERASE_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the bootloader version
    Version,
    /// Print the largest payload the bootloader accepts
    Mtu,
    /// Start the application
    Boot,
    /// Reset the target
    Reset,
    Erase {
        #[arg(value_parser = parse_u32)]
        address: u32,
        #[arg(value_parser = parse_u32)]
        size: u32,
    },
    /// Program the contents of `file` at `address`
    Write {
        #[arg(value_parser = parse_u32)]
        address: u32,
        file: PathBuf,
    },
    Verify {
        #[arg(value_parser = parse_u32)]
        address: u32,
        #[arg(value_parser = parse_u32)]
        size: u32,
        #[arg(value_parser = parse_u32)]
        crc: u32,
    },
    /// Program `file` as the application and store its `{size, crc32}`
    /// record, so the bootloader autoboots it on the next power-up
    Flash {
        file: PathBuf,
        /// Boot the new application once verified
        #[arg(long)]
        boot: bool,
    },
}

#[derive(Debug, Parser)]
struct Args {
    #[arg(short, long)]
    list_ports: bool,
    #[arg(short, long, default_value_t = String::from("/dev/ttyUSB0"))]
    port: String,
    #[arg(short, long, default_value_t = consts::UART_BAUDRATE)]
    baudrate: u32,
    #[command(subcommand)]
    cmd: Option<Command>,
}

/// Decimal or `0x` prefixed hexadecimal.
fn parse_u32(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("{s}: {e}"))
}

struct Link {
    serial: SerialStream,
    decoder: FrameDecoder,
}

impl Link {
    fn open(port: &str, baudrate: u32) -> Result<Self, Box<dyn Error>> {
        let serial = tokio_serial::new(port, baudrate).open_native_async()?;
        Ok(Self {
            serial,
            decoder: FrameDecoder::new(),
        })
    }

    /// Send `request` and wait for its response, which must be `Status::Ok`.
    async fn transact(&mut self, request: Request<'_>, timeout: Duration) -> Result<Response, Box<dyn Error>> {
        let mut buf = vec![0u8; MAX_FRAME_SIZE];
        let frame = request.encode(&mut buf).map_err(|e| format!("encode failed: {e:?}"))?;
        debug!(">> {:02x?}", &frame[..frame.len().min(16)]);
        self.serial.write_all(frame).await?;
        self.serial.flush().await?;

        let response = tokio::time::timeout(timeout, self.receive())
            .await
            .map_err(|_| "no response from device")??;
        debug!("<< {:?}", response);

        let opcode = u8::from(request.opcode());
        if response.opcode() != opcode {
            return Err(format!("response opcode {:#04x}, expected {:#04x}", response.opcode(), opcode).into());
        }
        if response.status() != Status::Ok {
            return Err(format!("device answered {:?}", response.status()).into());
        }
        Ok(response)
    }

    async fn receive(&mut self) -> Result<Response, Box<dyn Error>> {
        self.decoder.reset();
        let mut byte = [0u8; 1];
        loop {
            self.serial.read_exact(&mut byte).await?;
            match self.decoder.feed(byte[0]) {
                Ok(false) => {}
                Ok(true) => {
                    let frame = self.decoder.frame().ok_or("decoder lost the frame")?;
                    return Response::from_frame(frame).map_err(|status| format!("malformed response: {status:?}").into());
                }
                Err(rejection) => debug!("dropped garbled response: {:?}", rejection),
            }
        }
    }

    async fn mtu(&mut self) -> Result<u16, Box<dyn Error>> {
        let response = self.transact(Request::Inquiry(Inquiry::Mtu), RESPONSE_TIMEOUT).await?;
        match response.data() {
            [lo, hi] => Ok(u16::from_le_bytes([*lo, *hi])),
            other => Err(format!("unexpected MTU data {other:02x?}").into()),
        }
    }

    async fn write(&mut self, address: u32, image: &[u8]) -> Result<(), Box<dyn Error>> {
        let mtu = usize::from(self.mtu().await?);
        let chunk_size = mtu
            .saturating_sub(WriteRequest::HEADER_SIZE)
            .min(WriteRequest::MAX_DATA)
            / FLASH_WORD_SIZE as usize
            * FLASH_WORD_SIZE as usize;
        if chunk_size == 0 {
            return Err(format!("MTU {mtu} too small").into());
        }

        for (idx, chunk) in image.chunks(chunk_size).enumerate() {
            let offset = (idx * chunk_size) as u32;
            self.transact(
                Request::Write(WriteRequest {
                    address: address + offset,
                    data: chunk,
                }),
                RESPONSE_TIMEOUT,
            )
            .await?;
            info!("chunk {} written at {:#010x}", idx, address + offset);
        }
        Ok(())
    }

    async fn verify(&mut self, address: u32, size: u32, crc: u32) -> Result<(), Box<dyn Error>> {
        self.transact(Request::Verify(VerifyRequest { address, size, crc }), ERASE_TIMEOUT)
            .await?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    pretty_env_logger::init();

    let args = Args::parse();

    if args.list_ports {
        let ports = tokio_serial::available_ports()?;
        let ports: Vec<String> = ports.into_iter().map(|p| p.port_name).collect();
        println!("List of available serial ports:");
        for port in ports {
            println!("- {}", port);
        }
        return Ok(());
    }

    let Some(cmd) = args.cmd else {
        println!("Choose a command to be send.");
        return Ok(());
    };

    let mut link = Link::open(&args.port, args.baudrate)?;
    match cmd {
        Command::Version => {
            let response = link.transact(Request::Inquiry(Inquiry::Version), RESPONSE_TIMEOUT).await?;
            match response.data() {
                [major, minor] => println!("Bootloader version: {major}.{minor}"),
                other => println!("Unexpected version data {other:02x?}"),
            }
        }
        Command::Mtu => println!("MTU: {}", link.mtu().await?),
        Command::Boot => {
            link.transact(Request::Boot, RESPONSE_TIMEOUT).await?;
            println!("Application started");
        }
        Command::Reset => {
            link.transact(Request::Reset, RESPONSE_TIMEOUT).await?;
            println!("Resetting");
        }
        Command::Erase { address, size } => {
            link.transact(Request::Erase(EraseRequest { address, size }), ERASE_TIMEOUT)
                .await?;
            println!("Erased {size:#x} bytes at {address:#010x}");
        }
        Command::Write { address, file } => {
            let image = std::fs::read(&file)?;
            link.write(address, &image).await?;
            println!("Wrote {} bytes at {address:#010x}, crc32 {:#010x}", image.len(), checksum(&image));
        }
        Command::Verify { address, size, crc } => {
            link.verify(address, size, crc).await?;
            println!("Verify ok");
        }
        Command::Flash { file, boot } => {
            let image = std::fs::read(&file)?;
            if image.len() > FLASH_APP_SIZE as usize {
                return Err(format!("{} is larger than the application region", file.display()).into());
            }
            // Drop the old record first: an interrupted update must not look provisioned
            link.transact(
                Request::Erase(EraseRequest {
                    address: FLASH_META_ADDRESS,
                    size: FLASH_META_SIZE,
                }),
                ERASE_TIMEOUT,
            )
            .await?;
            link.transact(
                Request::Erase(EraseRequest {
                    address: FLASH_APP_ADDRESS,
                    size: FLASH_APP_SIZE,
                }),
                ERASE_TIMEOUT,
            )
            .await?;
            println!("Erased metadata and application regions");
            link.write(FLASH_APP_ADDRESS, &image).await?;
            link.verify(FLASH_APP_ADDRESS, image.len() as u32, checksum(&image)).await?;

            let record = image_record(&image);
            let record_address = FLASH_META_ADDRESS + FLASH_META_RECORD_OFFSET;
            link.write(record_address, &record).await?;
            link.verify(record_address, record.len() as u32, checksum(&record)).await?;
            println!("Stored image record at {record_address:#010x}");
            println!("Flashed and verified {} bytes from {}", image.len(), file.display());
            if boot {
                link.transact(Request::Boot, RESPONSE_TIMEOUT).await?;
                println!("Application started");
            }
        }
    }

    Ok(())
}
