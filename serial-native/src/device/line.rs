use crate::error::Error;

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    /// Five data bits.
    Five,
    /// Six data bits.
    Six,
    /// Seven data bits.
    Seven,
    /// Eight data bits.
    #[default]
    Eight,
}

/// Number of stop bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    /// One stop bit.
    #[default]
    One,
    /// Two stop bits.
    Two,
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,
    /// RTS/CTS hardware flow control.
    Hardware,
}

/// Line parameters applied to a device when it is opened.
///
/// The configuration is a plain value. It is applied once by
/// [`Dispatcher::open`] and not retained afterwards.
///
/// ```rust
/// use serial_native::{DataBits, LineConfig, Parity};
///
/// let config = LineConfig::new()
///     .baud(115_200)
///     .data_bits(DataBits::Seven)
///     .parity(Parity::Even);
/// assert_eq!(config.get_baud(), 115_200);
/// ```
///
/// [`Dispatcher::open`]: crate::Dispatcher::open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineConfig {
    pub(crate) baud: u32,
    pub(crate) data_bits: DataBits,
    pub(crate) stop_bits: StopBits,
    pub(crate) parity: Parity,
    pub(crate) flow_control: FlowControl,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            baud: 38_400,
            data_bits: DataBits::default(),
            stop_bits: StopBits::default(),
            parity: Parity::default(),
            flow_control: FlowControl::default(),
        }
    }
}

impl LineConfig {
    /// Creates the default configuration: 38400 baud, 8 data bits,
    /// 1 stop bit, no parity and no flow control.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a configuration from the integer encoding used by host bindings.
    ///
    /// Unrecognized data bits, stop bits, parity and flow control values fall
    /// back to their defaults. A negative baud rate is rejected.
    ///
    /// Parity does not imply a character size. Odd or even parity keeps the
    /// requested data bits instead of forcing 7, no parity does not force 8,
    /// and a stop bits value of 2 is honored whatever the parity. Callers
    /// that relied on parity selecting the character size must pass the
    /// data bits explicitly.
    pub fn from_raw(
        baud: i32,
        data_bits: i32,
        stop_bits: i32,
        parity: i32,
        flow_control: i32,
    ) -> Result<Self, Error> {
        let baud = u32::try_from(baud).map_err(|_| Error::invalid_argument())?;
        let data_bits = match data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };
        let stop_bits = match stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        };
        let parity = match parity {
            1 => Parity::Odd,
            2 => Parity::Even,
            _ => Parity::None,
        };
        let flow_control = match flow_control {
            1 => FlowControl::Hardware,
            _ => FlowControl::None,
        };
        Ok(Self {
            baud,
            data_bits,
            stop_bits,
            parity,
            flow_control,
        })
    }

    /// Sets the baud rate.
    pub fn baud(mut self, baud: u32) -> Self {
        self.baud = baud;
        self
    }

    /// Sets the number of data bits.
    pub fn data_bits(mut self, data_bits: DataBits) -> Self {
        self.data_bits = data_bits;
        self
    }

    /// Sets the number of stop bits.
    pub fn stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.stop_bits = stop_bits;
        self
    }

    /// Sets the parity mode.
    pub fn parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    /// Sets the flow control mode.
    pub fn flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }

    /// Returns the configured baud rate.
    pub fn get_baud(&self) -> u32 {
        self.baud
    }

    /// Returns the speed constant for the configured baud rate.
    pub(crate) fn speed(&self) -> Result<libc::speed_t, Error> {
        speed_constant(self.baud).ok_or_else(Error::invalid_argument)
    }

    /// Write this configuration into `termios`, putting the line in raw mode.
    pub(crate) fn apply(&self, termios: &mut libc::termios) -> Result<(), Error> {
        let speed = self.speed()?;
        set_speed(termios, speed)?;

        termios.c_cflag &= !(libc::CSIZE | libc::CSTOPB | libc::PARENB | libc::PARODD);
        termios.c_cflag &= !libc::CRTSCTS;
        termios.c_cflag |= match self.data_bits {
            DataBits::Five => libc::CS5,
            DataBits::Six => libc::CS6,
            DataBits::Seven => libc::CS7,
            DataBits::Eight => libc::CS8,
        };
        if self.stop_bits == StopBits::Two {
            termios.c_cflag |= libc::CSTOPB;
        }
        match self.parity {
            Parity::None => {}
            Parity::Odd => termios.c_cflag |= libc::PARENB | libc::PARODD,
            Parity::Even => termios.c_cflag |= libc::PARENB,
        }
        if self.flow_control == FlowControl::Hardware {
            termios.c_cflag |= libc::CRTSCTS;
        }

        // Ignore modem status lines, enable the receiver, drop DTR on close.
        termios.c_cflag |= libc::CLOCAL | libc::CREAD | libc::HUPCL;
        termios.c_iflag = libc::IGNPAR;
        termios.c_oflag = 0;
        termios.c_lflag = 0;
        termios.c_cc[libc::VMIN] = 1;
        termios.c_cc[libc::VTIME] = 0;
        Ok(())
    }
}

pub(crate) fn set_speed(termios: &mut libc::termios, speed: libc::speed_t) -> Result<(), Error> {
    if unsafe { libc::cfsetispeed(termios, speed) } == -1
        || unsafe { libc::cfsetospeed(termios, speed) } == -1
    {
        return Err(Error::last_os_error());
    }
    Ok(())
}

const SPEEDS: &[(u32, libc::speed_t)] = &[
    (0, libc::B0),
    (50, libc::B50),
    (75, libc::B75),
    (110, libc::B110),
    (134, libc::B134),
    (150, libc::B150),
    (200, libc::B200),
    (300, libc::B300),
    (600, libc::B600),
    (1_200, libc::B1200),
    (1_800, libc::B1800),
    (2_400, libc::B2400),
    (4_800, libc::B4800),
    (9_600, libc::B9600),
    (19_200, libc::B19200),
    (38_400, libc::B38400),
    (57_600, libc::B57600),
    (115_200, libc::B115200),
    (230_400, libc::B230400),
];

#[cfg(any(target_os = "linux", target_os = "android"))]
const EXTENDED_SPEEDS: &[(u32, libc::speed_t)] = &[
    (460_800, libc::B460800),
    (921_600, libc::B921600),
];

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const EXTENDED_SPEEDS: &[(u32, libc::speed_t)] = &[];

fn speeds() -> impl Iterator<Item = &'static (u32, libc::speed_t)> {
    SPEEDS.iter().chain(EXTENDED_SPEEDS)
}

/// Map a baud rate to its termios speed constant.
pub(crate) fn speed_constant(baud: u32) -> Option<libc::speed_t> {
    speeds()
        .find(|(rate, _)| *rate == baud)
        .map(|(_, speed)| *speed)
}

/// Map a termios speed constant back to its baud rate.
pub(crate) fn baud_rate(speed: libc::speed_t) -> Option<u32> {
    speeds()
        .find(|(_, constant)| *constant == speed)
        .map(|(rate, _)| *rate)
}
