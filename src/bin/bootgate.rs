//! Host simulator for the bootgate core.
//!
//! Drives a trusted core over an in-memory flash device, optionally
//! persisted to a file between runs, so image containers can be
//! packed, installed, verified and promoted without hardware.
#[macro_use]
extern crate clap;

use anyhow::{bail, Context, Result};
use bootgate_lib::{
    config::Configuration,
    devices::{
        bootloader::Bootloader,
        image::{
            builder::GblBuilder, parser::parse_buffer, ApplicationImageMetadata, ApplicationType,
            ImagePolicy, ImageProperties, ParserCallbacks, PRODUCT_ID_LENGTH,
        },
        interface::BootloaderInterface,
    },
    drivers::dma_serial::BufferedSerial,
    error::Error,
    hal::doubles::{dma::FakeDma, flash::FakeFlash, protection::PanickingReset, time::MockSysTick},
};
use clap::ArgMatches;
use log::{info, warn};
use p256::{ecdsa::SigningKey, pkcs8::DecodePrivateKey};
use std::{fs, path::Path, process};

type SimulatedSerial = BufferedSerial<FakeDma, MockSysTick, 256, 128>;
type SimulatedCore = Bootloader<FakeFlash, SimulatedSerial, PanickingReset>;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = clap_app!(bootgate =>
        (version: env!("CARGO_PKG_VERSION"))
        (about: env!("CARGO_PKG_DESCRIPTION"))
        (@setting SubcommandRequiredElseHelp)
        (@subcommand install =>
            (about: "Writes an image container to a slot and verifies it")
            (@arg config: +required "RON configuration of the device")
            (@arg image: +required "Image container to install")
            (@arg slot: -s --slot +takes_value +required "Destination slot")
            (@arg device: -d --device +takes_value "Raw device contents, loaded and saved back")
            (@arg boot: -b --boot "Promote the slot to boot first")
        )
        (@subcommand inspect =>
            (about: "Parses an image container in memory")
            (@arg image: +required "Image container to inspect")
            (@arg config: -c --config +takes_value "Verify against this configuration's policy")
        )
        (@subcommand pack =>
            (about: "Assembles an image container from a raw application binary")
            (@arg binary: +required "Raw application binary")
            (@arg output: +required "Destination container")
            (@arg address: -a --address +takes_value +required "Programming address of the binary")
            (@arg version: -v --version_number +takes_value "Application version")
            (@arg product: -p --product +takes_value "Product id, up to 16 bytes")
            (@arg metadata: -m --metadata +takes_value "File carried as a metadata tag")
            (@arg key: -k --key +takes_value "PKCS#8 PEM private key to sign with")
        )
        (@subcommand status =>
            (about: "Lists slot contents and the boot order of a saved device")
            (@arg config: +required "RON configuration of the device")
            (@arg device: +required "Raw device contents")
        )
    )
    .get_matches();

    let result = match matches.subcommand() {
        ("install", Some(arguments)) => install(arguments),
        ("inspect", Some(arguments)) => inspect(arguments),
        ("pack", Some(arguments)) => pack(arguments),
        ("status", Some(arguments)) => status(arguments),
        _ => unreachable!(),
    };

    if let Err(error) = result {
        eprintln!("Error: {:#}", error);
        process::exit(1);
    }
}

fn install(arguments: &ArgMatches) -> Result<()> {
    let configuration = Configuration::load(Path::new(required(arguments, "config")?))?;
    let image = fs::read(required(arguments, "image")?).context("Failed to read image")?;
    let slot = number(required(arguments, "slot")?)?;
    let device = arguments.value_of("device").map(Path::new);

    let mut core = simulated_core(&configuration, device)?;
    core.erase_and_write(slot, 0, &image)?;
    info!("Wrote {} bytes to slot {}", image.len(), slot);

    let properties = core.verify_image(slot)?;
    print_properties(&properties);

    if arguments.is_present("boot") {
        core.promote_slot_to_boot_first(slot)?;
        let order: Vec<u32> = core.images_to_bootload()?.slots().collect();
        println!("Boot order: {:?}", order);
    }

    if let Some(path) = device {
        fs::write(path, core.storage()?.device().contents())
            .with_context(|| format!("Failed to save device to {}", path.display()))?;
    }
    Ok(())
}

fn inspect(arguments: &ArgMatches) -> Result<()> {
    let image = fs::read(required(arguments, "image")?).context("Failed to read image")?;
    let policy = match arguments.value_of("config") {
        Some(path) => Configuration::load(Path::new(path))?.policy()?,
        None => ImagePolicy::default(),
    };

    let mut tally = Tally::default();
    let properties = parse_buffer(&image, &policy, &mut tally)?;
    print_properties(&properties);
    println!("Application bytes: {}", tally.application);
    println!("Metadata bytes: {}", tally.metadata);
    println!("Bootloader bytes: {}", tally.bootloader);
    Ok(())
}

fn pack(arguments: &ArgMatches) -> Result<()> {
    let binary = fs::read(required(arguments, "binary")?).context("Failed to read binary")?;
    let address = number(required(arguments, "address")?)?;
    let version = arguments.value_of("version").map(number).transpose()?.unwrap_or(0);

    let mut product_id = [0u8; PRODUCT_ID_LENGTH];
    if let Some(product) = arguments.value_of("product") {
        if product.len() > PRODUCT_ID_LENGTH {
            bail!("Product id longer than {} bytes", PRODUCT_ID_LENGTH);
        }
        product_id[..product.len()].copy_from_slice(product.as_bytes());
    }

    let metadata = ApplicationImageMetadata {
        application_type: ApplicationType::MCU,
        version,
        product_id,
        ..Default::default()
    };
    let mut builder = GblBuilder::new().application(&metadata).prog(address, &binary);
    if let Some(path) = arguments.value_of("metadata") {
        builder = builder.metadata(&fs::read(path).context("Failed to read metadata")?);
    }

    let container = match arguments.value_of("key") {
        Some(path) => {
            let pem = fs::read_to_string(path).context("Failed to read key")?;
            let key = SigningKey::from_pkcs8_pem(&pem)
                .map_err(|e| anyhow::anyhow!("Invalid signing key: {}", e))?;
            builder.build_signed(&key)
        }
        None => {
            warn!("Packing an unsigned container");
            builder.build()
        }
    };

    let output = required(arguments, "output")?;
    fs::write(output, &container).with_context(|| format!("Failed to write {}", output))?;
    info!("Packed {} byte container into {}", container.len(), output);
    Ok(())
}

fn status(arguments: &ArgMatches) -> Result<()> {
    let configuration = Configuration::load(Path::new(required(arguments, "config")?))?;
    let mut core = simulated_core(&configuration, Some(Path::new(required(arguments, "device")?)))?;

    let info = core.storage_info()?;
    println!(
        "Device: {} bytes, {} byte pages, {} slots",
        info.capacity, info.page_size, info.slot_count
    );
    for slot in 0..info.slot_count {
        let layout = core.slot_info(slot)?;
        let contents = match core.image_info(slot) {
            Ok(metadata) => format!("version {:#010x}, type {:?}", metadata.version, metadata.application_type),
            Err(Error::NoImage) => String::from("empty"),
            Err(error) => format!("invalid ({})", error),
        };
        println!("Slot {}: {:#x} (+{:#x}) {}", slot, layout.address, layout.length, contents);
    }
    match core.images_to_bootload() {
        Ok(order) => println!("Boot order: {:?}", order.slots().collect::<Vec<_>>()),
        Err(Error::MissingMetadata) => println!("Boot order: none"),
        Err(error) => return Err(error.into()),
    }
    Ok(())
}

fn simulated_core(configuration: &Configuration, device: Option<&Path>) -> Result<SimulatedCore> {
    let geometry = &configuration.storage;
    let mut flash = FakeFlash::new(geometry.page_size, geometry.capacity);
    if let Some(path) = device.filter(|path| path.exists()) {
        let contents = fs::read(path).context("Failed to read device")?;
        if contents.len() != geometry.capacity as usize {
            bail!("Device file does not match the configured capacity");
        }
        flash.load(0, &contents);
    }

    let mut core = Bootloader::new(configuration.policy()?, PanickingReset);
    core.bind_storage(configuration.storage(flash)?);
    Ok(core)
}

fn print_properties(properties: &ImageProperties) {
    let metadata = &properties.metadata;
    println!("Contents: {:?}", properties.contents);
    println!("Signed: {}, verified: {}", properties.signed, properties.verified);
    println!("Application type: {:?}", metadata.application_type);
    println!("Version: {:#010x}", metadata.version);
    println!("Product id: {}", String::from_utf8_lossy(&metadata.product_id).trim_end_matches('\0'));
}

fn required<'a>(arguments: &'a ArgMatches, name: &str) -> Result<&'a str> {
    arguments.value_of(name).with_context(|| format!("Missing argument {}", name))
}

/// Parses a decimal or `0x` prefixed hexadecimal number.
fn number(text: &str) -> Result<u32> {
    let parsed = match text.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.with_context(|| format!("Not a number: {}", text))
}

/// Counts payload bytes per callback.
#[derive(Default)]
struct Tally {
    application: usize,
    metadata: usize,
    bootloader: usize,
}

impl ParserCallbacks for Tally {
    fn application(&mut self, _: u32, data: &[u8]) { self.application += data.len(); }
    fn metadata(&mut self, _: u32, data: &[u8]) { self.metadata += data.len(); }
    fn bootloader(&mut self, _: u32, data: &[u8]) { self.bootloader += data.len(); }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn numbers_accept_hex_and_decimal() {
        assert_eq!(number("0x08008000").unwrap(), 0x0800_8000);
        assert_eq!(number("42").unwrap(), 42);
        assert!(number("0xZZ").is_err());
        assert!(number("forty").is_err());
    }
}
