#[macro_use]
extern crate clap;

use clap::{App, ArgMatches};
use env_logger::{from_env, Env};
use sifbox::{
    protocol::exit,
    runtime::{
        launcher, launcher::Launcher, supervisor, BindPath, EngineSpec, Namespaces, ProcessSpec,
    },
    sif::{
        arch_code, CreateInfo, CryptoExtra, DataSource, Datatype, DeletePolicy, DescriptorInput,
        Formattype, Fstype, Messagetype, OpenMode, Parttype, PartitionExtra, SifFile,
    },
    crypt,
};
use std::path::{Path, PathBuf};

fn main() {
    // The re-executed stage and supervisor roles receive numeric file
    // descriptor arguments on argv and bypass the user-facing parser
    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("stage") => stage_entry(&args[2..]),
        Some("supervisor") => supervisor_entry(),
        _ => (),
    }

    let yaml = load_yaml!("cli.yml");
    let matches = App::from_yaml(yaml).get_matches();

    let log_level = matches.value_of("log_level").unwrap();
    from_env(Env::default().default_filter_or(log_level)).init();

    let result = match matches.subcommand() {
        ("build", Some(sub)) => cmd_build(sub),
        ("inspect", Some(sub)) => cmd_inspect(sub),
        ("del", Some(sub)) => cmd_del(sub),
        ("run", Some(sub)) => cmd_run(sub),
        _ => unreachable!("subcommand required"),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(message) => {
            log::error!("{}", message);
            std::process::exit(0xFF);
        }
    }
}

fn stage_entry(args: &[String]) -> ! {
    from_env(Env::default().default_filter_or("warn")).init();

    let mut stage = None;
    let mut socket = None;
    let mut pairs = args.iter();
    while let Some(flag) = pairs.next() {
        let value = pairs.next().and_then(|v| v.parse::<i32>().ok());
        match flag.as_str() {
            "-stage" => stage = value,
            "-socket" => socket = value,
            "-rpc" => (),
            other => {
                log::error!("unknown stage argument {:?}", other);
                std::process::exit(exit::EXIT_IO_ERROR);
            }
        }
    }

    let (stage, socket) = match (stage, socket) {
        (Some(stage), Some(socket)) => (stage, socket),
        _ => {
            log::error!("stage entry needs -stage and -socket");
            std::process::exit(exit::EXIT_IO_ERROR);
        }
    };

    let result = match stage {
        1 => launcher::stage1_main(socket),
        2 => launcher::stage2_main(socket),
        other => {
            log::error!("unknown stage {}", other);
            std::process::exit(exit::EXIT_IO_ERROR);
        }
    };
    match result {
        Ok(()) => std::process::exit(exit::EXIT_OK),
        Err(err) => {
            log::error!("stage {} failed: {}", stage, err);
            std::process::exit(exit::EXIT_SETUP_FAILED);
        }
    }
}

fn supervisor_entry() -> ! {
    from_env(Env::default().default_filter_or("warn")).init();
    match supervisor::run_from_env() {
        Ok(status) => std::process::exit(status),
        Err(err) => {
            log::error!("supervisor failed: {}", err);
            std::process::exit(exit::EXIT_IO_ERROR);
        }
    }
}

fn cmd_build(matches: &ArgMatches) -> Result<i32, String> {
    let output = Path::new(matches.value_of("output").unwrap());
    let deffile = PathBuf::from(matches.value_of("deffile").unwrap());
    let partition = PathBuf::from(matches.value_of("partition").unwrap());
    let arch = matches.value_of("arch").unwrap();
    let arch = *arch_code(arch).map_err(|err| err.to_string())?;

    let mut inputs = vec![
        DescriptorInput::new(Datatype::Deffile, DataSource::File(deffile)).name("definition")
    ];

    // With a key URI the partition is first re-encrypted into a LUKS2
    // container, and the wrapped key travels inside the image
    let mut encrypted_temp = None;
    let mut wrapped_key = None;
    match matches.value_of("key_uri") {
        None => {
            inputs.push(
                DescriptorInput::new(Datatype::Partition, DataSource::File(partition))
                    .name("rootfs")
                    .group(1)
                    .partition(PartitionExtra {
                        fstype: Fstype::Squash,
                        parttype: Parttype::PrimSys,
                        arch,
                    }),
            );
        }
        Some(uri) => {
            let source = crypt::parse_uri(uri).map_err(|err| err.to_string())?;
            let key = crypt::new_key(&source).map_err(|err| err.to_string())?;
            let container = crypt::encrypt_filesystem(&partition, &key.bytes)
                .map_err(|err| err.to_string())?;
            inputs.push(
                DescriptorInput::new(Datatype::Partition, DataSource::File(container.clone()))
                    .name("rootfs")
                    .group(1)
                    .partition(PartitionExtra {
                        fstype: Fstype::EncryptedSquash,
                        parttype: Parttype::PrimSys,
                        arch,
                    }),
            );
            encrypted_temp = Some(container);
            wrapped_key = key.wrapped;
        }
    }

    if let Some(block) = wrapped_key {
        inputs.push(
            DescriptorInput::new(Datatype::CryptoMessage, DataSource::Bytes(block.into_bytes()))
                .name("wrapped-key")
                .link(2)
                .crypto(CryptoExtra {
                    format: Formattype::Pem,
                    message: Messagetype::RsaOaep,
                }),
        );
    }

    let image = SifFile::create(output, CreateInfo::new(inputs)).map_err(|err| err.to_string())?;
    if let Some(temp) = encrypted_temp {
        let _ = std::fs::remove_file(temp);
    }
    println!("{}", image.describe());
    Ok(0)
}

fn cmd_inspect(matches: &ArgMatches) -> Result<i32, String> {
    let image = SifFile::load(
        Path::new(matches.value_of("image").unwrap()),
        OpenMode::ReadOnly,
    )
    .map_err(|err| err.to_string())?;
    print!("{}", image.describe());
    Ok(0)
}

fn cmd_del(matches: &ArgMatches) -> Result<i32, String> {
    let id: u32 = matches
        .value_of("id")
        .unwrap()
        .parse()
        .map_err(|_| "descriptor id must be a number".to_string())?;
    let policy = if matches.is_present("zero") {
        DeletePolicy::Zero
    } else if matches.is_present("compact") {
        DeletePolicy::Compact
    } else {
        DeletePolicy::Default
    };

    let mut image = SifFile::load(
        Path::new(matches.value_of("image").unwrap()),
        OpenMode::ReadWrite,
    )
    .map_err(|err| err.to_string())?;
    image.delete_object(id, policy).map_err(|err| err.to_string())?;
    Ok(0)
}

fn cmd_run(matches: &ArgMatches) -> Result<i32, String> {
    let image = PathBuf::from(matches.value_of("image").unwrap());
    let args: Vec<String> = matches
        .values_of("run_args")
        .into_iter()
        .flatten()
        .map(String::from)
        .collect();
    let args = if args.is_empty() {
        vec!["/bin/sh".to_string()]
    } else {
        args
    };

    let binds = matches
        .values_of("bind")
        .into_iter()
        .flatten()
        .map(|pair| {
            let mut parts = pair.splitn(2, ':');
            let source = PathBuf::from(parts.next().unwrap());
            let destination = parts.next().map(PathBuf::from).unwrap_or_else(|| source.clone());
            BindPath {
                source,
                destination,
                read_only: true,
            }
        })
        .collect();

    let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
    let spec = EngineSpec {
        engine: "sif".to_string(),
        image: image.clone(),
        root: image,
        writable: false,
        overlay: None,
        binds,
        namespaces: Namespaces {
            user: matches.is_present("userns"),
            ipc: matches.is_present("ipc"),
            uts: matches.is_present("uts"),
            pid: matches.is_present("pid"),
            net: matches.is_present("net"),
            mount: true,
        },
        process: ProcessSpec {
            args,
            env: std::env::vars().map(|(k, v)| format!("{}={}", k, v)).collect(),
            cwd: "/".to_string(),
        },
        home: PathBuf::from(home),
        instance: matches.is_present("instance"),
        key_uri: matches.value_of("key_uri").map(String::from),
    };

    Launcher::new(spec).run().map_err(|err| err.to_string())
}
