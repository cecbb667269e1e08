use ch32v003_rsp::{RspServer, TargetAdapter};

struct DemoTarget {
    gpr: [u32; 16],
    dpc: u32,
    ram: [u32; 8],
    flash_writes: u32,
}

impl TargetAdapter for DemoTarget {
    fn get_gpr(&mut self, index: u8) -> u32 {
        self.gpr[index as usize]
    }

    fn set_gpr(&mut self, index: u8, value: u32) {
        self.gpr[index as usize] = value;
    }

    fn get_csr(&mut self, _id: u16) -> u32 {
        self.dpc
    }

    fn set_csr(&mut self, _id: u16, value: u32) {
        self.dpc = value;
    }

    fn get_mem(&mut self, addr: u32) -> u32 {
        let index = ((addr - 0x2000_0000) / 4) as usize;
        self.ram.get(index).copied().unwrap_or(0)
    }

    fn set_mem(&mut self, addr: u32, value: u32) {
        let index = ((addr - 0x2000_0000) / 4) as usize;
        if let Some(slot) = self.ram.get_mut(index) {
            *slot = value;
        }
    }

    fn get_block(&mut self, addr: u32, out: &mut [u32]) {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.get_mem(addr + (i as u32) * 4);
        }
    }

    fn wipe_chip(&mut self) {
        println!("target: chip erase");
    }

    fn wipe_sector(&mut self, addr: u32) {
        println!("target: sector erase at 0x{:08x}", addr);
    }

    fn wipe_page(&mut self, addr: u32) {
        println!("target: page erase at 0x{:08x}", addr);
    }

    fn write_flash(&mut self, page_base: u32, _data: &[u32; 16]) {
        self.flash_writes += 1;
        println!("target: program page at 0x{:08x}", page_base);
    }
}

/// Feed a whole `$...#cc` frame in and print whatever comes back, byte by
/// byte, the way a transport loop driving real hardware would.
fn run_frame(server: &mut RspServer<'_, DemoTarget>, frame: &[u8]) {
    print!("-> {} : ", String::from_utf8_lossy(frame));
    let mut reply = Vec::new();
    for &b in frame {
        let (out, valid) = server.tick(b, true);
        if valid {
            reply.push(out);
        }
    }
    loop {
        let (out, valid) = server.tick(0, false);
        if !valid {
            break;
        }
        reply.push(out);
    }
    println!("<- {}", String::from_utf8_lossy(&reply));
}

fn main() {
    env_logger::init();

    let mut target = DemoTarget {
        gpr: [0; 16],
        dpc: 0x0800_0100,
        ram: [0; 8],
        flash_writes: 0,
    };
    let mut server = RspServer::new(&mut target);

    run_frame(&mut server, b"$?#3f");
    run_frame(&mut server, b"$qSupported#37");
    run_frame(&mut server, b"$g#67");
    run_frame(&mut server, b"$M20000000,4:01000000#ea");
    run_frame(&mut server, b"$m20000000,4#4f");
}
