use super::clusters::SoilMeasurementHandler;
use super::device_types::DEV_TYPE_SOIL_SENSOR;
use super::netif::{FilteredNetifs, interface_addresses, interface_index, interface_name};
use crate::fabric::FabricRuntime;
use crate::sensors::SoilMoistureSensor;
use embassy_futures::select::{select, select4};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use log::{error, info};
use rs_matter::dm::IMBuffer;
use rs_matter::dm::clusters::desc::{self, ClusterHandler as _};
use rs_matter::dm::devices::test::{TEST_DEV_ATT, TEST_DEV_COMM, TEST_DEV_DET};
use rs_matter::dm::endpoints;
use rs_matter::dm::subscriptions::DefaultSubscriptions;
use rs_matter::dm::{
    Async, AsyncHandler, AsyncMetadata, DataModel, Dataver, EmptyHandler, Endpoint, EpClMatcher,
    Node,
};
use rs_matter::error::Error;
use rs_matter::pairing::DiscoveryCapabilities;
use rs_matter::pairing::qr::QrTextType;
use rs_matter::persist::{NO_NETWORKS, Psm};
use rs_matter::respond::DefaultResponder;
use rs_matter::transport::network::mdns::builtin::{BuiltinMdnsResponder, Host};
use rs_matter::transport::network::mdns::{
    MDNS_IPV4_BROADCAST_ADDR, MDNS_IPV6_BROADCAST_ADDR, MDNS_SOCKET_DEFAULT_BIND_ADDR,
};
use rs_matter::utils::init::InitMaybeUninit;
use rs_matter::utils::select::Coalesce;
use rs_matter::utils::storage::pooled::PooledBuffers;
use rs_matter::{MATTER_PORT, Matter, clusters, devices};
use socket2::{Domain, Protocol, Socket, Type};
use static_cell::StaticCell;
use std::fs;
use std::net::{IpAddr, Ipv6Addr, SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::pin::pin;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::config::MatterConfig;
use crate::fabric::types::ACCESS_CONTROL_CLUSTER_ID;

/// Static cells for Matter resources (required for 'static lifetime)
static MATTER: StaticCell<Matter> = StaticCell::new();
static BUFFERS: StaticCell<PooledBuffers<10, NoopRawMutex, IMBuffer>> = StaticCell::new();
static SUBSCRIPTIONS: StaticCell<DefaultSubscriptions> = StaticCell::new();
static PSM: StaticCell<Psm<4096>> = StaticCell::new();

/// Static hostname storage for mDNS (needs 'static lifetime for Host struct)
static HOSTNAME: OnceLock<String> = OnceLock::new();

/// Directory for persistence data
const PERSIST_DIR: &str = ".config/soil-matter-sensor";
const PERSIST_FILE: &str = "matter.bin";

/// How long the initial commissioning window stays open
const COMM_WINDOW_TIMEOUT_SECS: u16 = 900; // 15 minutes

/// How often observable commissioning state is folded into the registry
const COMMISSIONING_POLL_SECS: u64 = 2;

fn get_persist_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(PERSIST_DIR)
        .join(PERSIST_FILE)
}

/// Node definition for the soil sensor device
const NODE: Node<'static> = Node {
    id: 0,
    endpoints: &[
        // Endpoint 0: Root endpoint with standard Matter system clusters
        endpoints::root_endpoint(rs_matter::dm::clusters::net_comm::NetworkType::Ethernet),
        // Endpoint 1: Soil sensor with the SoilMeasurement cluster
        Endpoint {
            id: 1,
            device_types: devices!(DEV_TYPE_SOIL_SENSOR),
            clusters: clusters!(
                desc::DescHandler::CLUSTER,
                SoilMeasurementHandler::CLUSTER
            ),
        },
    ],
};

/// Cached network interface filter (lazily initialized)
static NETIFS: OnceLock<FilteredNetifs> = OnceLock::new();

fn get_netifs() -> &'static FilteredNetifs {
    NETIFS.get_or_init(|| FilteredNetifs::new(interface_name()))
}

/// Every committed fabric must be able to reach the Access Control cluster
/// on the root endpoint; a node without it cannot be administered at all.
/// Checked once before the stack starts serving.
fn verify_root_endpoint() -> Result<(), Error> {
    let root = &NODE.endpoints[0];
    if !root
        .clusters
        .iter()
        .any(|cluster| cluster.id == ACCESS_CONTROL_CLUSTER_ID)
    {
        error!("Root endpoint does not serve the Access Control cluster");
        return Err(rs_matter::error::ErrorCode::ClusterNotFound.into());
    }
    Ok(())
}

/// Fold observable commissioning progress into the control-plane registry.
///
/// rs-matter keeps its fabric table and secure sessions private; the only
/// externally visible signal is the commissioned flag. While the window is
/// open the capacity guard re-checks its free-slot guarantee on every poll
/// (session establishment is not surfaced as an event), and the flag
/// flipping marks the fabric commit.
async fn mirror_commissioning(
    matter: &Matter<'_>,
    fabric_runtime: &FabricRuntime,
) -> Result<(), Error> {
    let mut commissioned = matter.is_commissioned();
    loop {
        async_io::Timer::after(Duration::from_secs(COMMISSIONING_POLL_SECS)).await;

        let now = matter.is_commissioned();
        if now && !commissioned {
            let fabric = fabric_runtime.on_commissioning_complete();
            info!("Commissioning complete, recorded fabric {fabric}");
        }
        commissioned = now;

        if !now && fabric_runtime.context().comm_window.is_window_open() {
            fabric_runtime.on_commissioning_session_started();
        }
    }
}

/// Build the data model handler with the soil sensor clusters
fn dm_handler<'a>(
    matter: &'a Matter<'a>,
    soil_handler: &'a SoilMeasurementHandler,
) -> impl AsyncMetadata + AsyncHandler + 'a {
    (
        NODE,
        endpoints::with_eth(
            &(),
            get_netifs(),
            matter.rand(),
            endpoints::with_sys(
                &false,
                matter.rand(),
                EmptyHandler
                    // Endpoint 1: Descriptor
                    .chain(
                        EpClMatcher::new(Some(1), Some(desc::DescHandler::CLUSTER.id)),
                        Async(desc::DescHandler::new(Dataver::new_rand(matter.rand())).adapt()),
                    )
                    // Endpoint 1: SoilMeasurement
                    .chain(
                        EpClMatcher::new(Some(1), Some(SoilMeasurementHandler::CLUSTER.id)),
                        Async(soil_handler),
                    ),
            ),
        ),
    )
}

/// Run the Matter stack serving the soil sensor node.
///
/// Initializes transport, persistence and mDNS, opens the initial
/// commissioning window when the device is not yet commissioned, and then
/// serves the data model until the process exits.
///
/// Note: Currently uses test device credentials for development.
pub async fn run_matter_stack(
    _config: &MatterConfig,
    sensor: Arc<SoilMoistureSensor>,
    fabric_runtime: Arc<FabricRuntime>,
) -> Result<(), Error> {
    info!("Initializing Matter stack...");

    verify_root_endpoint()?;

    // Initialize the Matter instance in static memory
    let matter = MATTER.uninit().init_with(Matter::init(
        &TEST_DEV_DET,
        TEST_DEV_COMM,
        &TEST_DEV_ATT,
        rs_matter::utils::epoch::sys_epoch,
        rs_matter::utils::rand::sys_rand,
        MATTER_PORT,
    ));

    matter.initialize_transport_buffers()?;

    // Detect network interface and get addresses BEFORE socket creation:
    // the transport must bind to the IPv6 address advertised in mDNS so
    // responses use the same source address controllers send to.
    let if_name = interface_name();
    let if_index = interface_index(if_name)?;
    let (ipv4_addrs, ipv6_addrs) = interface_addresses(if_name)?;

    if ipv4_addrs.is_empty() {
        error!("No IPv4 address found on interface '{}'", if_name);
        return Err(rs_matter::error::ErrorCode::MdnsError.into());
    }

    let ipv6_addr = if ipv6_addrs.is_empty() {
        info!("No global IPv6 address on '{}', using unspecified", if_name);
        Ipv6Addr::UNSPECIFIED
    } else {
        ipv6_addrs[0]
    };

    info!(
        "Using interface '{}' (index {}) with {} and {}",
        if_name, if_index, ipv4_addrs[0], ipv6_addr
    );

    // UDP socket for Matter transport, dual-stack via socket2
    let raw_socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)).map_err(|e| {
        error!("Failed to create UDP socket: {}", e);
        rs_matter::error::ErrorCode::StdIoError
    })?;
    raw_socket.set_reuse_address(true).map_err(|e| {
        error!("Failed to set SO_REUSEADDR: {}", e);
        rs_matter::error::ErrorCode::StdIoError
    })?;
    raw_socket.set_only_v6(false).map_err(|e| {
        error!("Failed to set IPV6_V6ONLY=false: {}", e);
        rs_matter::error::ErrorCode::StdIoError
    })?;
    raw_socket.set_nonblocking(true).map_err(|e| {
        error!("Failed to set non-blocking: {}", e);
        rs_matter::error::ErrorCode::StdIoError
    })?;

    let bind_addr = SocketAddr::new(IpAddr::V6(ipv6_addr), MATTER_PORT);
    raw_socket.bind(&bind_addr.into()).map_err(|e| {
        error!("Failed to bind UDP socket to {:?}: {}", bind_addr, e);
        rs_matter::error::ErrorCode::StdIoError
    })?;
    let socket = async_io::Async::<UdpSocket>::new(raw_socket.into()).map_err(|e| {
        error!("Failed to create async socket: {}", e);
        rs_matter::error::ErrorCode::StdIoError
    })?;
    info!("Matter UDP socket bound to {:?}", bind_addr);

    // Initialize Psm (Persistent State Manager) and load existing state
    let persist_path = get_persist_path();

    if let Some(parent) = persist_path.parent()
        && let Err(e) = fs::create_dir_all(parent)
    {
        error!("Failed to create persistence directory {:?}: {}", parent, e);
    }

    let psm = PSM.uninit().init_with(Psm::init());
    if let Err(e) = psm.load(&persist_path, matter, NO_NETWORKS) {
        error!(
            "Failed to load persisted state from {:?}: {:?}",
            persist_path, e
        );
        // Continue anyway - will start fresh
    }

    // Only open a commissioning window if the device is not yet commissioned
    if matter.is_commissioned() {
        info!("Device already commissioned, skipping commissioning window");
        info!("  (Delete {:?} to reset commissioning)", persist_path);
        fabric_runtime.mirror_persisted_commissioning();
    } else {
        // Frees a fabric slot for the joining commissioner and mirrors the
        // window state into the registry
        fabric_runtime.open_commissioning_window_if_needed(Duration::from_secs(
            COMM_WINDOW_TIMEOUT_SECS as u64,
        ));

        info!(
            "Opening commissioning window for {} seconds...",
            COMM_WINDOW_TIMEOUT_SECS
        );
        matter.open_basic_comm_window(COMM_WINDOW_TIMEOUT_SECS)?;

        info!("Soil sensor ready for commissioning");
        info!("  Discriminator: {}", TEST_DEV_COMM.discriminator);
        info!("  Passcode: {}", TEST_DEV_COMM.password);

        if let Err(e) = matter.print_standard_qr_text(DiscoveryCapabilities::IP) {
            error!("Failed to print QR text: {:?}", e);
        }

        if let Err(e) =
            matter.print_standard_qr_code(QrTextType::Unicode, DiscoveryCapabilities::IP)
        {
            error!("Failed to print QR code: {:?}", e);
        }
    }

    // Initialize pooled buffers and subscriptions in static memory
    let buffers = BUFFERS.uninit().init_with(PooledBuffers::init(0));
    let subscriptions = SUBSCRIPTIONS
        .uninit()
        .init_with(DefaultSubscriptions::init());

    // Handler with a properly randomized Dataver seed; required for
    // subscription change tracking to work
    let soil_handler = SoilMeasurementHandler::new(Dataver::new_rand(matter.rand()), sensor);

    let handler = dm_handler(matter, &soil_handler);
    let dm = DataModel::new(matter, buffers, subscriptions, handler);

    let responder = DefaultResponder::new(&dm);

    info!("Matter stack running. Waiting for controller connections...");

    let mut transport = pin!(matter.run(&socket, &socket));

    // mDNS socket (separate from Matter transport, binds to port 5353);
    // rs-matter's built-in responder correctly answers subtype PTR queries,
    // which multi-admin commissioning via phone apps requires
    let mdns_socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)).map_err(|e| {
        error!("Failed to create mDNS socket: {}", e);
        rs_matter::error::ErrorCode::MdnsError
    })?;
    mdns_socket.set_reuse_address(true).map_err(|e| {
        error!("Failed to set SO_REUSEADDR on mDNS socket: {}", e);
        rs_matter::error::ErrorCode::MdnsError
    })?;
    mdns_socket.set_only_v6(false).map_err(|e| {
        error!("Failed to set IPV6_V6ONLY=false on mDNS socket: {}", e);
        rs_matter::error::ErrorCode::MdnsError
    })?;
    mdns_socket.set_nonblocking(true).map_err(|e| {
        error!("Failed to set non-blocking on mDNS socket: {}", e);
        rs_matter::error::ErrorCode::MdnsError
    })?;
    mdns_socket
        .bind(&MDNS_SOCKET_DEFAULT_BIND_ADDR.into())
        .map_err(|e| {
            error!(
                "Failed to bind mDNS socket to {:?}: {}",
                MDNS_SOCKET_DEFAULT_BIND_ADDR, e
            );
            rs_matter::error::ErrorCode::MdnsError
        })?;

    let mdns_socket =
        async_io::Async::<UdpSocket>::new_nonblocking(mdns_socket.into()).map_err(|e| {
            error!("Failed to create async mDNS socket: {}", e);
            rs_matter::error::ErrorCode::MdnsError
        })?;

    mdns_socket
        .get_ref()
        .join_multicast_v6(&MDNS_IPV6_BROADCAST_ADDR, if_index)
        .map_err(|e| {
            error!("Failed to join IPv6 multicast group: {}", e);
            rs_matter::error::ErrorCode::MdnsError
        })?;
    mdns_socket
        .get_ref()
        .join_multicast_v4(&MDNS_IPV4_BROADCAST_ADDR, &ipv4_addrs[0])
        .map_err(|e| {
            error!("Failed to join IPv4 multicast group: {}", e);
            rs_matter::error::ErrorCode::MdnsError
        })?;

    info!("mDNS socket bound to {:?}", MDNS_SOCKET_DEFAULT_BIND_ADDR);

    let hostname =
        HOSTNAME.get_or_init(|| gethostname::gethostname().to_string_lossy().into_owned());

    let host = Host {
        id: 0,
        hostname,
        ip: ipv4_addrs[0].octets().into(),
        ipv6: ipv6_addr.octets().into(),
    };

    let mdns_responder = BuiltinMdnsResponder::new(matter);
    let mut mdns = pin!(mdns_responder.run(
        &mdns_socket,
        &mdns_socket,
        &host,
        Some(ipv4_addrs[0].octets().into()),
        Some(if_index),
    ));

    let mut respond = pin!(responder.run::<4, 4>());

    let mut dm_job = pin!(dm.run());

    // Persistence task - saves state via Psm when it changes
    let mut persist = pin!(psm.run(&persist_path, matter, NO_NETWORKS));

    // Commissioning observer feeding the fabric control plane
    let mut mirror = pin!(mirror_commissioning(matter, &fabric_runtime));

    let result = select4(
        &mut transport,
        &mut mdns,
        select(&mut respond, &mut dm_job).coalesce(),
        select(&mut persist, &mut mirror).coalesce(),
    )
    .coalesce()
    .await;

    if let Err(e) = result {
        error!("Matter stack error: {:?}", e);
        return Err(e);
    }

    Ok(())
}
