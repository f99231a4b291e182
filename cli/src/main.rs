#[macro_use] extern crate clap;

use clap::{App, ArgMatches};
use env_logger::{from_env, Env};
use std::{env, io, net::SocketAddr, path::Path, sync::Arc, time::Duration};
use svm_layers::{
    CommandPlatform, Dialer, LayerError, LayerService, LayerStream, TcpDialer, UnixDialer,
};

#[tokio::main]
async fn main() {
    let yaml = load_yaml!("cli.yml");
    let matches = App::from_yaml(yaml).get_matches();

    let log_level = matches.value_of("log_level").unwrap();
    from_env(Env::default().default_filter_or(log_level)).init();

    let service = build_service(&matches).expect("failed to configure layer service");
    let vm_id = service
        .service_vm_id()
        .await
        .expect("no service VM")
        .to_string();

    let result = match matches.subcommand() {
        ("import", Some(sub)) => {
            let dir = Path::new(sub.value_of("dir").unwrap());
            service
                .import_layer(&vm_id, dir, tokio::io::stdin())
                .await
                .map(|size| log::info!("wrote {} byte layer", size))
        }
        ("export", Some(sub)) => {
            let dir = Path::new(sub.value_of("dir").unwrap());
            match service.export_layer(&vm_id, dir).await {
                Ok(stream) => to_stdout(stream).await,
                Err(err) => Err(err),
            }
        }
        ("create-sandbox", Some(sub)) => {
            let file = Path::new(sub.value_of("file").unwrap());
            let size_mb = value_t!(sub, "size_mb", u64).unwrap_or_else(|e| e.exit());
            service.create_sandbox(&vm_id, file, size_mb).await
        }
        ("export-sandbox", Some(sub)) => {
            let dir = Path::new(sub.value_of("dir").unwrap());
            match service.export_sandbox_layer(&vm_id, dir).await {
                Ok(stream) => to_stdout(stream).await,
                Err(err) => Err(err),
            }
        }
        _ => unreachable!(),
    };

    if let Err(err) = result {
        log::error!("{}", err);
        std::process::exit(0xFF);
    }
}

fn build_service(matches: &ArgMatches) -> Result<LayerService, LayerError> {
    let mut builder = LayerService::builder()
        .dialer(dialer(matches))
        .disk_platform(Arc::new(CommandPlatform::new(Path::new(
            matches.value_of("disk_helper").unwrap(),
        ))));
    if let Some(dir) = matches.value_of("cache_dir") {
        builder = builder.cache_dir(Path::new(dir));
    }
    if matches.is_present("connect_timeout_ms") {
        let ms = value_t!(matches, "connect_timeout_ms", u64).unwrap_or_else(|e| e.exit());
        builder = builder.connect_timeout(Duration::from_millis(ms));
    }
    builder = match matches.value_of("vm") {
        Some(id) => builder.service_vm_id(id.to_string()),
        None => builder.service_vm_resolver(|| {
            env::var("SVM_LAYERS_VM").map_err(|_| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    "pass --vm or set $SVM_LAYERS_VM",
                )
            })
        }),
    };
    builder.build()
}

fn dialer(matches: &ArgMatches) -> Arc<dyn Dialer> {
    if let Some(dir) = matches.value_of("socket_dir") {
        return Arc::new(UnixDialer::new(Path::new(dir)));
    }
    let mut dialer = TcpDialer::new();
    for route in string_values(matches, "tcp") {
        let mut parts = route.splitn(2, '=');
        let vm_id = parts.next().unwrap();
        let addr: SocketAddr = parts
            .next()
            .expect("--tcp wants ID=ADDR")
            .parse()
            .expect("bad socket address");
        dialer = dialer.route(vm_id, addr);
    }
    Arc::new(dialer)
}

async fn to_stdout(mut stream: LayerStream) -> Result<(), LayerError> {
    let mut stdout = tokio::io::stdout();
    let copied = tokio::io::copy(&mut stream, &mut stdout).await;
    let size = stream.finish().await?;
    copied?;
    log::info!("wrote {} byte tar", size);
    Ok(())
}

fn string_values<S: AsRef<str>>(matches: &ArgMatches, name: S) -> Vec<String> {
    matches
        .values_of(name)
        .into_iter()
        .flat_map(|values| values.map(|value| value.to_string()))
        .collect()
}
